use std::hash::Hash;

use indexmap::IndexSet;

use courier_core::messages::MessageKey;

/// Default number of keys remembered.
pub const DEFAULT_CAPACITY: usize = 500;

/// Bounded, insertion-ordered set of recently seen keys.
///
/// Capacity is soft: once it is exceeded the oldest quarter of the entries is
/// evicted in one batch, so the set never holds more than
/// `capacity + eviction_batch()` keys.
#[derive(Debug)]
pub struct DedupCache<K = MessageKey> {
    entries: IndexSet<K>,
    capacity: usize,
}

/// Dedup cache over message keys.
pub type DeduplicationCache = DedupCache<MessageKey>;

impl<K: Hash + Eq> DedupCache<K> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: IndexSet::with_capacity(capacity + 1),
            capacity,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    /// Record `key`. Returns `false` if it was already present; its position
    /// is left unchanged in that case.
    pub fn add(&mut self, key: K) -> bool {
        if !self.entries.insert(key) {
            return false;
        }
        if self.entries.len() > self.capacity {
            let evict = self.eviction_batch().min(self.entries.len());
            self.entries.drain(..evict);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of keys dropped per eviction.
    pub fn eviction_batch(&self) -> usize {
        (self.capacity / 4).max(1)
    }
}

impl<K: Hash + Eq> Default for DedupCache<K> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_reports_novelty() {
        let mut cache = DedupCache::new(10);
        assert!(cache.add("a"));
        assert!(!cache.add("a"));
        assert!(cache.contains(&"a"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evicts_oldest_quartile_when_over_capacity() {
        let mut cache = DedupCache::new(8);
        for i in 0..8 {
            cache.add(i);
        }
        assert_eq!(cache.len(), 8);

        cache.add(8);
        // 9 entries > 8, drop the oldest 2
        assert_eq!(cache.len(), 7);
        assert!(!cache.contains(&0));
        assert!(!cache.contains(&1));
        assert!(cache.contains(&2));
        assert!(cache.contains(&8));
    }

    #[test]
    fn size_never_exceeds_capacity_plus_batch() {
        for capacity in [1, 2, 3, 7, 100, 500] {
            let mut cache = DedupCache::new(capacity);
            let bound = cache.capacity() + cache.eviction_batch();
            for i in 0..(capacity * 5 + 3) {
                cache.add(i);
                assert!(cache.len() <= bound, "capacity {capacity}: {} > {bound}", cache.len());
            }
        }
    }

    #[test]
    fn duplicate_add_does_not_refresh_position() {
        let mut cache = DedupCache::new(4);
        for k in ["a", "b", "c", "d"] {
            cache.add(k);
        }
        cache.add("a");
        cache.add("e");
        // "a" was still the oldest
        assert!(!cache.contains(&"a"));
        assert!(cache.contains(&"b"));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut cache: DedupCache<u32> = DedupCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.add(1);
        cache.add(2);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&2));
    }

    #[test]
    fn default_capacity() {
        let cache: DeduplicationCache = DedupCache::default();
        assert_eq!(cache.capacity(), 500);
        assert_eq!(cache.eviction_batch(), 125);
        assert!(cache.is_empty());
    }
}
