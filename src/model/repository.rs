//! A source repository and the builds defined in it

use std::sync::atomic::{AtomicBool, Ordering};

use crate::id::{BuildId, BuildName, RepositoryId, RepositoryKey, RepositoryName};
use crate::model::build::Build;
use crate::model::keyed::KeyedMap;

#[derive(Debug)]
pub struct Repository {
    key: RepositoryKey,
    name: RepositoryName,
    enabled: AtomicBool,
    builds: KeyedMap<BuildId, Build>,
}

impl Repository {
    pub(crate) fn new(key: RepositoryKey, name: RepositoryName) -> Self {
        Self {
            key,
            name,
            enabled: AtomicBool::new(true),
            builds: KeyedMap::new(),
        }
    }

    pub fn key(&self) -> &RepositoryKey {
        &self.key
    }

    pub fn id(&self) -> &RepositoryId {
        &self.key.repository
    }

    pub fn name(&self) -> &RepositoryName {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn builds(&self) -> &KeyedMap<BuildId, Build> {
        &self.builds
    }

    /// Build a build stamped with this repository's key. Does not insert it.
    pub fn create_build(&self, name: BuildName, id: BuildId) -> Build {
        Build::new(self.key.build(id), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::OwnerKey;

    #[test]
    fn test_create_build_defaults() {
        let repo = Repository::new(
            OwnerKey::new("GitHub".into(), "acme".into()).repository("1".into()),
            "widgets".into(),
        );
        let build = repo.create_build("CI".into(), "10".into());

        assert!(build.is_enabled());
        assert_eq!(build.key().repository_key(), *repo.key());
        assert!(repo.builds().is_empty());
    }
}
