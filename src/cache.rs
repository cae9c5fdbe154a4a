//! LRU cache of validated forms.
//!
//! Forms are read on every engine call but change only through
//! `register_form`, which invalidates the entry. Reads use `peek` under the
//! read lock so concurrent lookups never serialize on the write lock.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::RwLock;

use crate::types::{Form, FormId};

/// Shared form cache. A capacity of zero disables caching.
#[derive(Debug, Clone)]
pub struct FormCache {
    inner: Option<Arc<RwLock<LruCache<FormId, Arc<Form>>>>>,
}

impl FormCache {
    /// Create a cache holding up to `capacity` forms.
    pub fn new(capacity: usize) -> Self {
        let inner = NonZeroUsize::new(capacity).map(|cap| Arc::new(RwLock::new(LruCache::new(cap))));
        Self { inner }
    }

    /// A cache that stores nothing.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Cached form, if present.
    pub fn get(&self, id: &FormId) -> Option<Arc<Form>> {
        self.inner.as_ref()?.read().peek(id).cloned()
    }

    /// Insert or replace a form.
    pub fn put(&self, form: Arc<Form>) {
        if let Some(cache) = &self.inner {
            cache.write().put(form.id(), form);
        }
    }

    /// Drop a form so the next read goes to the store.
    pub fn invalidate(&self, id: &FormId) {
        if let Some(cache) = &self.inner {
            cache.write().pop(id);
        }
    }

    /// Get cache statistics. Returns `None` if caching is disabled.
    pub fn stats(&self) -> Option<CacheStats> {
        self.inner.as_ref().map(|cache| {
            let cache = cache.read();
            CacheStats { len: cache.len(), cap: cache.cap().get() }
        })
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    /// Current number of entries in the cache.
    pub len: usize,
    /// Maximum capacity of the cache.
    pub cap: usize,
}
