//! Soft LRU result cache
//!
//! Bounds the memory spent on repeatedly loaded weight tables and version
//! indices during detection. The cache may drop any entry at any time; the
//! artifact store on disk remains the canonical source.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

pub struct SoftCache<K, V> {
    inner: Mutex<CacheInner<K, V>>,
}

struct CacheInner<K, V> {
    entries: HashMap<K, (V, u64)>,
    stamp: u64,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> SoftCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                stamp: 0,
                capacity: capacity.max(1),
                hits: 0,
                misses: 0,
            }),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.stamp += 1;
        let stamp = inner.stamp;
        match inner.entries.get_mut(key) {
            Some((value, last_used)) => {
                *last_used = stamp;
                let value = value.clone();
                inner.hits += 1;
                Some(value)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn put(&self, key: K, value: V) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if inner.entries.len() >= inner.capacity && !inner.entries.contains_key(&key) {
            if let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, (_, stamp))| *stamp)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&oldest);
            }
        }
        inner.stamp += 1;
        let stamp = inner.stamp;
        inner.entries.insert(key, (value, stamp));
    }

    /// Fetch through the cache, loading on miss.
    pub fn get_or_try_insert<E>(
        &self,
        key: &K,
        load: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }
        let value = load()?;
        self.put(key.clone(), value.clone());
        Ok(value)
    }

    pub fn hit_rate(&self) -> f64 {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let total = inner.hits + inner.misses;
        if total == 0 {
            0.0
        } else {
            inner.hits as f64 / total as f64
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let cache: SoftCache<&str, u32> = SoftCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.get(&"a"), Some(1)); // refresh "a"
        cache.put("c", 3); // evicts "b"

        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"c"), Some(3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn get_or_try_insert_loads_once() {
        let cache: SoftCache<String, u32> = SoftCache::new(8);
        let mut loads = 0;
        for _ in 0..3 {
            let v: Result<u32, ()> = cache.get_or_try_insert(&"k".to_string(), || {
                loads += 1;
                Ok(7)
            });
            assert_eq!(v.unwrap(), 7);
        }
        assert_eq!(loads, 1);
        assert!(cache.hit_rate() > 0.5);
    }

    #[test]
    fn load_failure_is_not_cached() {
        let cache: SoftCache<String, u32> = SoftCache::new(8);
        let failed: Result<u32, &str> =
            cache.get_or_try_insert(&"k".to_string(), || Err("nope"));
        assert!(failed.is_err());
        assert!(cache.is_empty());
    }
}
