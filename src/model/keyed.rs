//! Concurrency-safe keyed collection used for every child map in the tree

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Map from a typed id to a shared entity.
///
/// Readers get snapshots (`values`, `entries`) so callers can iterate while
/// refreshes insert and remove concurrently. `get_or_insert_with` is atomic:
/// two racing callers for the same key end up holding the same `Arc`.
#[derive(Debug)]
pub struct KeyedMap<K, V> {
    inner: RwLock<HashMap<K, Arc<V>>>,
}

impl<K, V> Default for KeyedMap<K, V> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V> KeyedMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<K, Arc<V>>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<K, Arc<V>>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.read().get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.read().contains_key(key)
    }

    /// Returns the existing value or inserts the one built by `make`.
    /// The flag is true when this call inserted.
    pub fn get_or_insert_with(&self, key: K, make: impl FnOnce() -> V) -> (Arc<V>, bool) {
        if let Some(existing) = self.get(&key) {
            return (existing, false);
        }
        let mut map = self.write();
        if let Some(existing) = map.get(&key) {
            return (existing.clone(), false);
        }
        let value = Arc::new(make());
        map.insert(key, value.clone());
        (value, true)
    }

    /// Inserts only when the key is free. Returns true on insert.
    pub fn insert_if_absent(&self, key: K, value: V) -> bool {
        let mut map = self.write();
        if map.contains_key(&key) {
            return false;
        }
        map.insert(key, Arc::new(value));
        true
    }

    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.write().remove(key)
    }

    pub fn values(&self) -> Vec<Arc<V>> {
        self.read().values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<K> {
        self.read().keys().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(K, Arc<V>)> {
        self.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Keeps only the entries for which `keep` returns true; returns how many were dropped.
    pub fn retain(&self, mut keep: impl FnMut(&K, &Arc<V>) -> bool) -> usize {
        let mut map = self.write();
        let before = map.len();
        map.retain(|k, v| keep(k, v));
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn clear(&self) {
        self.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_get_or_insert_returns_existing() {
        let map: KeyedMap<String, u32> = KeyedMap::new();

        let (first, inserted) = map.get_or_insert_with("a".to_string(), || 1);
        assert!(inserted);
        let (second, inserted) = map.get_or_insert_with("a".to_string(), || 2);
        assert!(!inserted);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*second, 1);
    }

    #[test]
    fn test_racing_inserts_create_one_value() {
        let map: Arc<KeyedMap<u32, u32>> = Arc::new(KeyedMap::new());
        let created = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let map = map.clone();
                let created = created.clone();
                thread::spawn(move || {
                    for key in 0..50 {
                        let (_, inserted) = map.get_or_insert_with(key, || key);
                        if inserted {
                            created.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(created.load(Ordering::SeqCst), 50);
        assert_eq!(map.len(), 50);
    }

    #[test]
    fn test_insert_if_absent_and_remove() {
        let map: KeyedMap<&'static str, u32> = KeyedMap::new();
        assert!(map.insert_if_absent("x", 1));
        assert!(!map.insert_if_absent("x", 2));
        assert_eq!(map.get(&"x").map(|v| *v), Some(1));

        assert!(map.remove(&"x").is_some());
        assert!(!map.contains(&"x"));
        assert!(map.is_empty());
    }

    #[test]
    fn test_retain_reports_dropped() {
        let map: KeyedMap<u32, u32> = KeyedMap::new();
        for i in 0..10 {
            map.insert_if_absent(i, i);
        }
        let dropped = map.retain(|_, v| **v % 2 == 0);
        assert_eq!(dropped, 5);
        assert_eq!(map.len(), 5);
    }

    #[test]
    fn test_snapshot_survives_mutation() {
        let map: KeyedMap<u32, u32> = KeyedMap::new();
        map.insert_if_absent(1, 1);
        let snapshot = map.values();
        map.clear();
        assert_eq!(snapshot.len(), 1);
        assert!(map.is_empty());
    }
}
