//! Registry of requests currently in flight, keyed by display path

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

#[derive(Debug, Default)]
struct Entry {
    started: Option<DateTime<Utc>>,
    count: usize,
}

/// Paths look like `{provider}/{owner}/{repo}/{build}[/{run}]`.
#[derive(Debug, Clone, Default)]
pub struct ActiveRequests {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl ActiveRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `path` as in flight until the guard drops
    pub fn begin(&self, path: impl Into<String>) -> ActiveRequestGuard {
        let path = path.into();
        {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = map.entry(path.clone()).or_default();
            entry.count += 1;
            entry.started.get_or_insert_with(Utc::now);
        }
        ActiveRequestGuard {
            registry: self.clone(),
            path,
        }
    }

    fn end(&self, path: &str) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = map.get_mut(path) {
            entry.count = entry.count.saturating_sub(1);
            if entry.count == 0 {
                map.remove(path);
            }
        }
    }

    pub fn is_active(&self, path: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(path)
    }

    /// True when any in-flight path equals `prefix` or sits below it
    pub fn any_with_prefix(&self, prefix: &str) -> bool {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.keys()
            .any(|path| path == prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/')))
    }

    /// In-flight paths with the time they started
    pub fn snapshot(&self) -> Vec<(String, DateTime<Utc>)> {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<_> = map
            .iter()
            .filter_map(|(path, entry)| entry.started.map(|started| (path.clone(), started)))
            .collect();
        entries.sort();
        entries
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes its path from the registry when dropped
#[derive(Debug)]
pub struct ActiveRequestGuard {
    registry: ActiveRequests,
    path: String,
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.registry.end(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_tracks_lifetime() {
        let active = ActiveRequests::new();
        {
            let _guard = active.begin("GitHub/acme/widgets/CI");
            assert!(active.is_active("GitHub/acme/widgets/CI"));
            assert_eq!(active.snapshot().len(), 1);
        }
        assert!(active.is_empty());
    }

    #[test]
    fn test_overlapping_requests_same_path() {
        let active = ActiveRequests::new();
        let first = active.begin("GitHub/acme");
        let second = active.begin("GitHub/acme");
        drop(first);
        assert!(active.is_active("GitHub/acme"));
        drop(second);
        assert!(!active.is_active("GitHub/acme"));
    }

    #[test]
    fn test_prefix_matches_whole_segments() {
        let active = ActiveRequests::new();
        let _guard = active.begin("GitHub/acme/widgets/CI/Run 42");

        assert!(active.any_with_prefix("GitHub/acme/widgets/CI"));
        assert!(active.any_with_prefix("GitHub/acme"));
        assert!(!active.any_with_prefix("GitHub/acme/widgets/C"));
        assert!(!active.any_with_prefix("GitHub/other"));
    }
}
