//! Seen-message ledger used for flood loop suppression.

use std::num::NonZeroUsize;

use lru::LruCache;

/// Records which message ids this node already processed.
///
/// Unbounded by default: an id, once marked, stays marked for the node's
/// lifetime. With a capacity the oldest ids are evicted first, after which
/// a late duplicate of an evicted id would be processed again.
pub struct SeenLedger {
    cache: LruCache<String, ()>,
}

impl SeenLedger {
    /// Ledger that never evicts.
    pub fn unbounded() -> Self {
        Self {
            cache: LruCache::unbounded(),
        }
    }

    /// Ledger holding at most `capacity` ids (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
        }
    }

    /// Build from an optional capacity, `None` meaning unbounded.
    pub fn from_capacity(capacity: Option<usize>) -> Self {
        match capacity {
            Some(cap) => Self::with_capacity(cap),
            None => Self::unbounded(),
        }
    }

    /// Whether `id` was already marked.
    pub fn contains(&self, id: &str) -> bool {
        self.cache.contains(id)
    }

    /// Mark `id`. Returns `false` if it was already present.
    pub fn mark(&mut self, id: &str) -> bool {
        if self.cache.contains(id) {
            return false;
        }
        self.cache.put(id.to_string(), ());
        true
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl Default for SeenLedger {
    fn default() -> Self {
        Self::unbounded()
    }
}
