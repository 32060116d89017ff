// Seen-id cache: optional loop suppression for meshed relays

use lru::LruCache;
use std::num::NonZeroUsize;

/// Bounded memory of recently relayed envelope ids.
///
/// Once full, the least recently seen id is forgotten, so an envelope that
/// circulates longer than `capacity` other envelopes can pass again.
pub struct SeenCache {
    ids: LruCache<String, ()>,
}

impl SeenCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            ids: LruCache::new(capacity),
        }
    }

    /// Record `id`; returns `true` the first time it is seen
    pub fn observe(&mut self, id: &str) -> bool {
        if self.ids.get(id).is_some() {
            return false;
        }
        self.ids.put(id.to_string(), ());
        true
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ids.cap().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> SeenCache {
        SeenCache::new(NonZeroUsize::new(capacity).unwrap())
    }

    #[test]
    fn test_second_sighting_is_duplicate() {
        let mut seen = cache(8);
        assert!(seen.observe("a"));
        assert!(!seen.observe("a"));
        assert!(seen.observe("b"));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_oldest_id_is_evicted() {
        let mut seen = cache(2);
        assert!(seen.observe("a"));
        assert!(seen.observe("b"));
        assert!(seen.observe("c"));
        assert_eq!(seen.len(), 2);
        // "a" was evicted
        assert!(seen.observe("a"));
        assert_eq!(seen.capacity(), 2);
    }

    #[test]
    fn test_sighting_refreshes_recency() {
        let mut seen = cache(2);
        seen.observe("a");
        seen.observe("b");
        assert!(!seen.observe("a"));
        seen.observe("c");
        // "b" was least recent, so "a" survived
        assert!(!seen.observe("a"));
        assert!(seen.observe("b"));
    }
}
