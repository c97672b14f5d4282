//! Size-bounded LRU cache whose entries expire after a fixed TTL.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Default lifetime of a cached IPFS document.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);
/// Default maximum number of cached documents.
pub const DEFAULT_CAPACITY: usize = 30_000;

/// Thread-safe LRU + TTL cache of fetched payloads.
pub struct TtlCache {
    inner: Mutex<LruCache<String, (Instant, Vec<u8>)>>,
    ttl: Duration,
}

impl TtlCache {
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Returns a live entry, evicting it when expired.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let expired = match inner.get(key) {
            Some((stored_at, value)) if stored_at.elapsed() < self.ttl => {
                return Some(value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.pop(key);
        }
        None
    }

    pub fn insert(&self, key: impl Into<String>, value: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.put(key.into(), (Instant::now(), value));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}
