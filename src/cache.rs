//! Domain-existence cache
//!
//! Link insertion checks whether a URL's registerable domain already has a
//! `domain_info` row before writing the link. That check sits on the hot
//! path of every parsed URL, so a bounded LRU in front of the store absorbs
//! the repeats.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Bounded LRU mapping TLD+1 -> known/absent
///
/// Entries record what the store said the last time the domain was looked
/// up; `true` for an existing `domain_info` row, `false` for a confirmed
/// miss. Eviction simply forces the next lookup back to the store.
#[derive(Debug)]
pub struct DomainCache {
    inner: Mutex<LruCache<String, bool>>,
}

impl DomainCache {
    /// Creates a cache holding at most `capacity` domains
    ///
    /// A zero capacity is clamped to one entry.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the cached existence verdict, if any
    pub fn get(&self, dom: &str) -> Option<bool> {
        self.inner.lock().unwrap().get(dom).copied()
    }

    /// Records an existence verdict for a domain
    pub fn set(&self, dom: &str, exists: bool) {
        self.inner.lock().unwrap().put(dom.to_string(), exists);
    }

    /// Number of cached verdicts, for diagnostics
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miss_then_hit() {
        let cache = DomainCache::new(4);
        assert!(cache.is_empty());
        assert_eq!(cache.get("example.com"), None);

        cache.set("example.com", true);
        assert_eq!(cache.get("example.com"), Some(true));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_caches_absence_too() {
        let cache = DomainCache::new(4);
        cache.set("missing.com", false);
        assert_eq!(cache.get("missing.com"), Some(false));
    }

    #[test]
    fn test_eviction_at_capacity() {
        let cache = DomainCache::new(2);
        cache.set("a.com", true);
        cache.set("b.com", true);
        cache.set("c.com", true);

        assert_eq!(cache.get("a.com"), None);
        assert_eq!(cache.get("b.com"), Some(true));
        assert_eq!(cache.get("c.com"), Some(true));
    }

    #[test]
    fn test_get_refreshes_recency() {
        let cache = DomainCache::new(2);
        cache.set("a.com", true);
        cache.set("b.com", true);

        // Touch a.com so b.com becomes the eviction candidate.
        cache.get("a.com");
        cache.set("c.com", true);

        assert_eq!(cache.get("a.com"), Some(true));
        assert_eq!(cache.get("b.com"), None);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let cache = DomainCache::new(0);
        cache.set("a.com", true);
        assert_eq!(cache.get("a.com"), Some(true));
    }
}
