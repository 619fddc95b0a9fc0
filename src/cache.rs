//! Fixed-capacity bitmap cache with insertion-order eviction. FIFO rather
//! than LRU on purpose: lookups here are hit-or-miss only, so tracking
//! access recency buys nothing over the O(1) order queue.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::Fingerprint;
use crate::codec::CachedBitmap;

pub struct BoundedCanvasCache {
    map: FxHashMap<Fingerprint, CachedBitmap>,
    order: VecDeque<Fingerprint>,
    capacity: usize,
}

impl BoundedCanvasCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: FxHashMap::default(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &Fingerprint) -> Option<&CachedBitmap> {
        self.map.get(key)
    }

    /// Insert, evicting the earliest-inserted entry first when at capacity.
    /// Re-inserting an existing key refreshes the value in place.
    pub fn put(&mut self, key: Fingerprint, bitmap: CachedBitmap) {
        if self.map.contains_key(&key) {
            self.map.insert(key, bitmap);
            return;
        }
        if self.map.len() >= self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.map.remove(&oldest);
        }
        self.order.push_back(key.clone());
        self.map.insert(key, bitmap);
    }

    /// Drop the `n` earliest-inserted entries. Returns how many were evicted.
    pub fn evict_oldest(&mut self, n: usize) -> usize {
        let mut evicted = 0;
        for _ in 0..n {
            match self.order.pop_front() {
                Some(key) => {
                    self.map.remove(&key);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(name: &str) -> Fingerprint {
        Fingerprint { name: name.to_string(), size: 1, modified_ms: 0 }
    }

    fn bitmap(tag: u8) -> CachedBitmap {
        CachedBitmap { data: Arc::from(vec![tag; 8]), width: 2, height: 2 }
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut cache = BoundedCanvasCache::new(3);
        for i in 0..10 {
            cache.put(key(&format!("f{i}")), bitmap(i));
            assert!(cache.len() <= 3);
        }
    }

    #[test]
    fn test_evicts_earliest_inserted() {
        let mut cache = BoundedCanvasCache::new(2);
        cache.put(key("a"), bitmap(1));
        cache.put(key("b"), bitmap(2));
        // Hitting "a" must not save it: eviction order ignores access.
        assert!(cache.get(&key("a")).is_some());

        cache.put(key("c"), bitmap(3));
        assert!(cache.get(&key("a")).is_none());
        assert!(cache.get(&key("b")).is_some());
        assert!(cache.get(&key("c")).is_some());
    }

    #[test]
    fn test_reinsert_refreshes_without_growth() {
        let mut cache = BoundedCanvasCache::new(2);
        cache.put(key("a"), bitmap(1));
        cache.put(key("a"), bitmap(9));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key("a")).unwrap().data[0], 9);

        // "a" keeps its original insertion slot, so it is still evicted first.
        cache.put(key("b"), bitmap(2));
        cache.put(key("c"), bitmap(3));
        assert!(cache.get(&key("a")).is_none());
    }

    #[test]
    fn test_evict_oldest_half() {
        let mut cache = BoundedCanvasCache::new(8);
        for i in 0..8 {
            cache.put(key(&format!("f{i}")), bitmap(i));
        }
        assert_eq!(cache.evict_oldest(4), 4);
        assert_eq!(cache.len(), 4);
        assert!(cache.get(&key("f0")).is_none());
        assert!(cache.get(&key("f4")).is_some());
    }

    #[test]
    fn test_clear() {
        let mut cache = BoundedCanvasCache::new(4);
        cache.put(key("a"), bitmap(1));
        cache.clear();
        assert!(cache.is_empty());
        cache.put(key("a"), bitmap(1));
        assert_eq!(cache.len(), 1);
    }
}
