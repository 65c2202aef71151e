//! Bounded least-recently-used map.
//!
//! Used for block, inode, MFT record and grain-table caches. Recency is
//! tracked by [`lru::LruCache`]; this wrapper adds a validated capacity and
//! hit/miss counters.

use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;
use vms_error::{Result, VmsError};

pub struct LruCache<K, V> {
    inner: lru::LruCache<K, V>,
    hits: u64,
    misses: u64,
}

impl<K: Eq + Hash, V> fmt::Debug for LruCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruCache")
            .field("len", &self.inner.len())
            .field("capacity", &self.inner.cap())
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .finish()
    }
}

impl<K: Eq + Hash, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            VmsError::InvalidConfig("LRU cache capacity must be > 0".to_owned())
        })?;
        Ok(Self {
            inner: lru::LruCache::new(capacity),
            hits: 0,
            misses: 0,
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.cap().get()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains(key)
    }

    /// Look up `key`, marking it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let value = self.inner.get(key);
        if value.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        value
    }

    /// Insert or replace `key`. Returns the evicted entry, if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if self.inner.contains(&key) {
            self.inner.put(key, value);
            return None;
        }
        self.inner.push(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.pop(key)
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// `(hits, misses)` since construction.
    #[must_use]
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

impl<K: Eq + Hash, V: Clone> LruCache<K, V> {
    /// Clone of the cached value, marking it most recently used.
    pub fn get_cloned(&mut self, key: &K) -> Option<V> {
        self.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(LruCache::<u64, u64>::new(0).is_err());
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = LruCache::new(2).expect("cache");
        assert!(cache.insert(1_u64, "a").is_none());
        assert!(cache.insert(2, "b").is_none());
        assert_eq!(cache.get(&1), Some(&"a"));
        let evicted = cache.insert(3, "c");
        assert_eq!(evicted, Some((2, "b")));
        assert!(cache.contains(&1));
        assert!(cache.contains(&3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn replacing_a_key_does_not_evict() {
        let mut cache = LruCache::new(2).expect("cache");
        cache.insert(1_u64, 10_u32);
        cache.insert(2, 20);
        assert!(cache.insert(1, 11).is_none());
        assert_eq!(cache.get_cloned(&1), Some(11));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn never_grows_past_capacity() {
        let mut cache = LruCache::new(50).expect("cache");
        for i in 0..1000_u64 {
            cache.insert(i, i);
        }
        assert_eq!(cache.len(), 50);
        assert!(cache.contains(&999));
        assert!(!cache.contains(&949));
    }

    #[test]
    fn hits_keep_an_entry_alive_in_a_full_cache() {
        let mut cache = LruCache::new(256).expect("cache");
        for i in 0..256_u64 {
            cache.insert(i, i);
        }
        for round in 0..256_u64 {
            assert_eq!(cache.get(&0), Some(&0));
            cache.insert(1000 + round, round);
        }
        assert!(cache.contains(&0));
        assert_eq!(cache.len(), 256);
        assert_eq!(cache.stats(), (256, 0));
    }

    #[test]
    fn tracks_hits_and_misses() {
        let mut cache = LruCache::new(4).expect("cache");
        cache.insert(7_u64, ());
        let _ = cache.get(&7);
        let _ = cache.get(&8);
        assert_eq!(cache.stats(), (1, 1));
        assert_eq!(cache.remove(&7), Some(()));
        assert!(cache.is_empty());
    }
}
