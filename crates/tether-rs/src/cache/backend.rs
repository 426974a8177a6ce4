//! The remote cache capability.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use crate::context::ContextItem;
use crate::error::CacheError;

/// Boxed future returned by [`CacheBackend`] operations.
pub type CacheFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CacheError>> + Send + 'a>>;

/// Content to precompute remotely.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheCreateRequest {
    pub model: String,
    pub display_name: String,
    pub pinned_instruction: String,
    pub items: Vec<ContextItem>,
    /// Estimated tokens of everything above.
    pub token_count: usize,
    pub ttl: Duration,
}

/// A cache as the remote side reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCache {
    pub id: String,
    pub display_name: String,
    pub token_count: usize,
    pub expires_at: Instant,
}

/// A remote explicit-cache service.
///
/// Implementations must be safe to call concurrently from many sessions.
pub trait CacheBackend: Send + Sync {
    fn create<'a>(&'a self, request: &'a CacheCreateRequest) -> CacheFuture<'a, RemoteCache>;

    /// Push the expiry out to now + `ttl`. Returns the new expiry.
    fn extend<'a>(&'a self, id: &'a str, ttl: Duration) -> CacheFuture<'a, Instant>;

    fn delete<'a>(&'a self, id: &'a str) -> CacheFuture<'a, ()>;

    fn list(&self) -> CacheFuture<'_, Vec<RemoteCache>>;

    /// Smallest prefix, in tokens, the remote side will cache.
    fn min_tokens(&self) -> usize;
}
