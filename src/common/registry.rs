//! Concurrency-safe registries (data nodes on the master, lock holders)

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;

/// Insert-if-absent map shared between request handlers.
pub trait ConcurrentMap<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<V>;

    /// Returns false (and keeps the existing value) when `key` is present.
    fn set_if_absent(&self, key: K, value: V) -> bool;

    fn remove(&self, key: &K) -> Option<V>;

    fn values(&self) -> Vec<V>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// [`ConcurrentMap`] over a single `RwLock<HashMap>`.
#[derive(Debug)]
pub struct LockedMap<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for LockedMap<K, V> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> LockedMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K, V> ConcurrentMap<K, V> for LockedMap<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> Option<V> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(key).cloned()
    }

    fn set_if_absent(&self, key: K, value: V) -> bool {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(&key) {
            return false;
        }
        map.insert(key, value);
        true
    }

    fn remove(&self, key: &K) -> Option<V> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.remove(key)
    }

    fn values(&self) -> Vec<V> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.values().cloned().collect()
    }

    fn len(&self) -> usize {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_set_if_absent() {
        let map: LockedMap<String, u32> = LockedMap::new();
        assert!(map.is_empty());
        assert!(map.set_if_absent("a".into(), 1));
        assert!(!map.set_if_absent("a".into(), 2));
        assert_eq!(map.get(&"a".into()), Some(1));
        assert_eq!(map.remove(&"a".into()), Some(1));
        assert_eq!(map.get(&"a".into()), None);
    }

    #[test]
    fn test_concurrent_inserts_keep_first() {
        let map: Arc<LockedMap<u32, usize>> = Arc::new(LockedMap::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let map = map.clone();
                std::thread::spawn(move || {
                    for k in 0..100 {
                        map.set_if_absent(k, t);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(map.len(), 100);
    }
}
