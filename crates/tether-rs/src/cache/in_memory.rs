//! In-process cache backend.
//!
//! Simulates a remote explicit-cache service: enforces the minimum prefix
//! size, tracks expiry, and can be told to fail or stall creation so
//! degradation paths can be exercised without a network.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use super::backend::{CacheBackend, CacheCreateRequest, CacheFuture, RemoteCache};
use crate::error::CacheError;

/// Minimum cacheable prefix on common explicit-cache services.
pub const DEFAULT_MIN_CACHE_TOKENS: usize = 4096;

#[derive(Debug)]
pub struct InMemoryCacheBackend {
    entries: Mutex<HashMap<String, RemoteCache>>,
    next_id: AtomicU64,
    min_tokens: usize,
    create_delay: Option<Duration>,
    fail_creates: AtomicBool,
    creates: AtomicUsize,
    extends: AtomicUsize,
    deletes: AtomicUsize,
}

impl Default for InMemoryCacheBackend {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_CACHE_TOKENS)
    }
}

impl InMemoryCacheBackend {
    pub fn new(min_tokens: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            min_tokens,
            create_delay: None,
            fail_creates: AtomicBool::new(false),
            creates: AtomicUsize::new(0),
            extends: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    /// Stall every `create` call this long.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Make subsequent `create` calls fail with a backend error.
    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Number of caches successfully created.
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn extend_count(&self) -> usize {
        self.extends.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Caches currently stored, expired or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Force a cache to expire now.
    pub fn expire(&self, id: &str) {
        if let Some(entry) = self.lock().get_mut(id) {
            entry.expires_at = Instant::now();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RemoteCache>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CacheBackend for InMemoryCacheBackend {
    fn create<'a>(&'a self, request: &'a CacheCreateRequest) -> CacheFuture<'a, RemoteCache> {
        Box::pin(async move {
            if let Some(delay) = self.create_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_creates.load(Ordering::SeqCst) {
                return Err(CacheError::Backend("cache creation rejected".into()));
            }
            if request.token_count < self.min_tokens {
                return Err(CacheError::BelowMinimum {
                    tokens: request.token_count,
                    minimum: self.min_tokens,
                });
            }
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            let cache = RemoteCache {
                id: format!("cachedContents/{n:06}"),
                display_name: request.display_name.clone(),
                token_count: request.token_count,
                expires_at: Instant::now() + request.ttl,
            };
            self.lock().insert(cache.id.clone(), cache.clone());
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(cache)
        })
    }

    fn extend<'a>(&'a self, id: &'a str, ttl: Duration) -> CacheFuture<'a, Instant> {
        Box::pin(async move {
            let mut entries = self.lock();
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| CacheError::NotFound(id.to_string()))?;
            let now = Instant::now();
            if now >= entry.expires_at {
                return Err(CacheError::NotFound(id.to_string()));
            }
            entry.expires_at = now + ttl;
            self.extends.fetch_add(1, Ordering::SeqCst);
            Ok(entry.expires_at)
        })
    }

    fn delete<'a>(&'a self, id: &'a str) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            self.lock()
                .remove(id)
                .ok_or_else(|| CacheError::NotFound(id.to_string()))?;
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn list(&self) -> CacheFuture<'_, Vec<RemoteCache>> {
        Box::pin(async move {
            let mut caches: Vec<RemoteCache> = self.lock().values().cloned().collect();
            caches.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(caches)
        })
    }

    fn min_tokens(&self) -> usize {
        self.min_tokens
    }
}
