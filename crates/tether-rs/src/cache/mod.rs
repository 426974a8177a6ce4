//! Explicit prompt-cache coordination.
//!
//! A [`CacheHandle`] references a remote precomputed prefix: the pinned
//! instruction, optionally followed by a leading run of conversation items.
//! The [`CacheCoordinator`] decides per call whether to attach one, checks
//! it item by item against the current [`ContextSnapshot`](crate::context::ContextSnapshot),
//! extends it near expiry and drops it the moment the covered prefix changes.
//!
//! - [`handle`] — [`CacheHandle`] and [`PrefixFingerprint`].
//! - [`backend`] — the [`CacheBackend`] trait a remote cache service implements.
//! - [`in_memory`] — [`InMemoryCacheBackend`], an in-process simulation.
//! - [`coordinator`] — [`CacheCoordinator`], [`CacheSlot`], [`PreparedRequest`].

pub mod backend;
pub mod coordinator;
pub mod handle;
pub mod in_memory;

pub use backend::{CacheBackend, CacheCreateRequest, CacheFuture, RemoteCache};
pub use coordinator::{
    CacheConfig, CacheCoordinator, CacheEvent, CacheSlot, CacheTelemetry, PreparedRequest,
};
pub use handle::{CacheHandle, PrefixFingerprint};
pub use in_memory::{DEFAULT_MIN_CACHE_TOKENS, InMemoryCacheBackend};
