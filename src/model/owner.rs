//! An account, organization or project that groups repositories

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::id::{OwnerKey, OwnerName, RepositoryId, RepositoryName};
use crate::model::keyed::KeyedMap;
use crate::model::repository::Repository;

#[derive(Debug)]
pub struct Owner {
    key: OwnerKey,
    enabled: AtomicBool,
    token: RwLock<Option<String>>,
    repositories: KeyedMap<RepositoryId, Repository>,
}

impl Owner {
    pub(crate) fn new(key: OwnerKey) -> Self {
        Self {
            key,
            enabled: AtomicBool::new(true),
            token: RwLock::new(None),
            repositories: KeyedMap::new(),
        }
    }

    pub fn key(&self) -> &OwnerKey {
        &self.key
    }

    pub fn name(&self) -> &OwnerName {
        &self.key.owner
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Owner-scoped credential that overrides the provider token
    pub fn token(&self) -> Option<String> {
        self.token.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = token.filter(|t| !t.is_empty());
    }

    pub fn repositories(&self) -> &KeyedMap<RepositoryId, Repository> {
        &self.repositories
    }

    /// Build a repository stamped with this owner's key. Does not insert it.
    pub fn create_repository(&self, name: RepositoryName, id: RepositoryId) -> Repository {
        Repository::new(self.key.repository(id), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_repository_defaults() {
        let owner = Owner::new(OwnerKey::new("GitHub".into(), "acme".into()));
        let repo = owner.create_repository("widgets".into(), "1".into());

        assert!(repo.is_enabled());
        assert_eq!(repo.key().owner_key(), *owner.key());
        assert!(owner.repositories().is_empty());
    }

    #[test]
    fn test_empty_token_is_none() {
        let owner = Owner::new(OwnerKey::new("GitHub".into(), "acme".into()));
        owner.set_token(Some(String::new()));
        assert!(owner.token().is_none());

        owner.set_token(Some("ghp_x".to_string()));
        assert_eq!(owner.token().as_deref(), Some("ghp_x"));
    }
}
