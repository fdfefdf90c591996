//! Strongly typed identifiers for the entity tree
//!
//! Every entity kind gets its own newtype so an id from one level can never be
//! used to index another. Back-navigation uses the key structs below, which
//! carry the ids of every ancestor by value instead of live references.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Name a provider is registered under, e.g. `GitHub`
    ProviderName
);
string_id!(
    /// Account, organization or project name; owners are keyed by name
    OwnerName
);
string_id!(RepositoryId);
string_id!(RepositoryName);
string_id!(BuildId);
string_id!(BuildName);
string_id!(RunId);
string_id!(RunName);
string_id!(BranchName);

/// Locates an owner through the tree root
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerKey {
    pub provider: ProviderName,
    pub owner: OwnerName,
}

/// Locates a repository through the tree root
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryKey {
    pub provider: ProviderName,
    pub owner: OwnerName,
    pub repository: RepositoryId,
}

/// Locates a build through the tree root
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildKey {
    pub provider: ProviderName,
    pub owner: OwnerName,
    pub repository: RepositoryId,
    pub build: BuildId,
}

/// Locates a run through the tree root
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunKey {
    pub provider: ProviderName,
    pub owner: OwnerName,
    pub repository: RepositoryId,
    pub build: BuildId,
    pub run: RunId,
}

impl OwnerKey {
    pub fn new(provider: ProviderName, owner: OwnerName) -> Self {
        Self { provider, owner }
    }

    pub fn repository(&self, repository: RepositoryId) -> RepositoryKey {
        RepositoryKey {
            provider: self.provider.clone(),
            owner: self.owner.clone(),
            repository,
        }
    }
}

impl RepositoryKey {
    pub fn owner_key(&self) -> OwnerKey {
        OwnerKey::new(self.provider.clone(), self.owner.clone())
    }

    pub fn build(&self, build: BuildId) -> BuildKey {
        BuildKey {
            provider: self.provider.clone(),
            owner: self.owner.clone(),
            repository: self.repository.clone(),
            build,
        }
    }
}

impl BuildKey {
    pub fn repository_key(&self) -> RepositoryKey {
        RepositoryKey {
            provider: self.provider.clone(),
            owner: self.owner.clone(),
            repository: self.repository.clone(),
        }
    }

    pub fn run(&self, run: RunId) -> RunKey {
        RunKey {
            provider: self.provider.clone(),
            owner: self.owner.clone(),
            repository: self.repository.clone(),
            build: self.build.clone(),
            run,
        }
    }
}

impl RunKey {
    pub fn build_key(&self) -> BuildKey {
        BuildKey {
            provider: self.provider.clone(),
            owner: self.owner.clone(),
            repository: self.repository.clone(),
            build: self.build.clone(),
        }
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.owner)
    }
}

impl fmt::Display for RepositoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.provider, self.owner, self.repository)
    }
}

impl fmt::Display for BuildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.provider, self.owner, self.repository, self.build)
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.provider, self.owner, self.repository, self.build, self.run
        )
    }
}
