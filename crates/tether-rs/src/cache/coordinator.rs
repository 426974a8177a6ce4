//! Per-call cache decisions.
//!
//! [`CacheCoordinator::prepare`] turns a [`ContextSnapshot`] into the content
//! actually sent: with a valid handle attached, only the suffix beyond the
//! covered prefix goes out fresh. Every failure path degrades to sending
//! everything fresh; nothing here can change what the model sees.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::{CacheBackend, CacheCreateRequest};
use super::handle::{CacheHandle, PrefixFingerprint};
use super::in_memory::DEFAULT_MIN_CACHE_TOKENS;
use crate::context::{ContextItem, ContextSnapshot};
use crate::error::CacheError;

/// Display-name prefix marking caches this coordinator created.
const DISPLAY_PREFIX: &str = "tether";

// ── Configuration ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Smallest prefix worth caching. The backend's own minimum also applies.
    pub min_tokens: usize,
    pub ttl: Duration,
    /// TTL requested when extending a live handle.
    pub extended_ttl: Duration,
    /// Extend once fewer than this remain.
    pub extend_threshold: Duration,
    pub create_timeout: Duration,
    pub renewal_interval: Duration,
    /// Also cache the conversation (minus the newest unit) when the pinned
    /// instruction alone is below the minimum.
    pub cache_conversation: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            min_tokens: DEFAULT_MIN_CACHE_TOKENS,
            ttl: Duration::from_secs(300),
            extended_ttl: Duration::from_secs(600),
            extend_threshold: Duration::from_secs(60),
            create_timeout: Duration::from_secs(10),
            renewal_interval: Duration::from_secs(30),
            cache_conversation: false,
        }
    }
}

impl CacheConfig {
    pub fn with_min_tokens(mut self, tokens: usize) -> Self {
        self.min_tokens = tokens;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_extended_ttl(mut self, ttl: Duration) -> Self {
        self.extended_ttl = ttl;
        self
    }

    pub fn with_extend_threshold(mut self, threshold: Duration) -> Self {
        self.extend_threshold = threshold;
        self
    }

    pub fn with_create_timeout(mut self, timeout: Duration) -> Self {
        self.create_timeout = timeout;
        self
    }

    pub fn with_renewal_interval(mut self, interval: Duration) -> Self {
        self.renewal_interval = interval;
        self
    }

    pub fn with_cache_conversation(mut self, enabled: bool) -> Self {
        self.cache_conversation = enabled;
        self
    }
}

// ── Slot ───────────────────────────────────────────────────────────

/// A session's cache handle, shared between the loop and background renewal.
///
/// Replacement is compare-and-swap on the handle id, so a renewal that raced
/// with an invalidation can never resurrect a dropped handle.
#[derive(Debug, Clone, Default)]
pub struct CacheSlot {
    inner: Arc<Mutex<Option<CacheHandle>>>,
}

impl CacheSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<CacheHandle> {
        self.lock().clone()
    }

    /// Id of the current handle, if any.
    pub fn current_id(&self) -> Option<String> {
        self.lock().as_ref().map(|h| h.id.clone())
    }

    /// Replace the handle only if the current one has id `expected`
    /// (`None` = slot empty). Returns whether the swap happened.
    pub fn compare_and_swap(&self, expected: Option<&str>, new: Option<CacheHandle>) -> bool {
        let mut guard = self.lock();
        if guard.as_ref().map(|h| h.id.as_str()) != expected {
            return false;
        }
        *guard = new;
        true
    }

    /// Apply `f` to the handle if it still has id `id`.
    pub fn update(&self, id: &str, f: impl FnOnce(&mut CacheHandle)) -> bool {
        match self.lock().as_mut() {
            Some(handle) if handle.id == id => {
                f(handle);
                true
            }
            _ => false,
        }
    }

    pub fn take(&self) -> Option<CacheHandle> {
        self.lock().take()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<CacheHandle>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── Prepared request ───────────────────────────────────────────────

/// Cached vs fresh split for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheTelemetry {
    pub cached_tokens: usize,
    pub fresh_tokens: usize,
}

/// What the coordinator did while preparing a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Created { id: String, tokens: usize },
    Reused { id: String, tokens: usize },
    Extended { id: String },
    Invalidated { id: String, reason: String },
    Failed { reason: String },
}

/// Content to send for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    /// `None` when the cache covers the instruction.
    pub pinned_instruction: Option<String>,
    /// Items not covered by the cache.
    pub items: Vec<ContextItem>,
    pub cache_ref: Option<String>,
    pub telemetry: CacheTelemetry,
    pub events: Vec<CacheEvent>,
}

impl PreparedRequest {
    /// Everything fresh, no cache.
    fn uncached(snapshot: &ContextSnapshot, events: Vec<CacheEvent>) -> Self {
        Self {
            pinned_instruction: Some(snapshot.pinned_instruction.text.clone()),
            items: snapshot.items.clone(),
            cache_ref: None,
            telemetry: CacheTelemetry {
                cached_tokens: 0,
                fresh_tokens: snapshot.total_tokens,
            },
            events,
        }
    }

    fn cached(snapshot: &ContextSnapshot, handle: &CacheHandle, events: Vec<CacheEvent>) -> Self {
        let covered = handle.covered_items().min(snapshot.items.len());
        Self {
            pinned_instruction: None,
            items: snapshot.items[covered..].to_vec(),
            cache_ref: Some(handle.id.clone()),
            telemetry: CacheTelemetry {
                cached_tokens: handle.token_count,
                fresh_tokens: snapshot.total_tokens.saturating_sub(handle.token_count),
            },
            events,
        }
    }
}

// ── Coordinator ────────────────────────────────────────────────────

/// Decides, per call, whether to attach a cache handle and keeps it valid.
///
/// Shared across sessions; each session owns its own [`CacheSlot`].
#[derive(Clone)]
pub struct CacheCoordinator {
    backend: Option<Arc<dyn CacheBackend>>,
    config: CacheConfig,
    model: String,
    /// Ids this coordinator created, with whether a slot still holds them.
    owned: Arc<Mutex<HashMap<String, bool>>>,
}

impl std::fmt::Debug for CacheCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("enabled", &self.is_enabled())
            .field("config", &self.config)
            .field("model", &self.model)
            .finish()
    }
}

impl CacheCoordinator {
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig, model: impl Into<String>) -> Self {
        Self {
            backend: Some(backend),
            config,
            model: model.into(),
            owned: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// A coordinator that never caches.
    pub fn disabled() -> Self {
        Self {
            backend: None,
            config: CacheConfig::default(),
            model: String::new(),
            owned: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Annotate one call. Never fails; cache trouble means no cache.
    pub async fn prepare(&self, slot: &CacheSlot, snapshot: &ContextSnapshot) -> PreparedRequest {
        let Some(backend) = self.backend.as_ref() else {
            return PreparedRequest::uncached(snapshot, Vec::new());
        };
        let mut events = Vec::new();
        let now = Instant::now();

        if let Some(handle) = slot.get() {
            if handle.is_valid_for(snapshot, now) {
                let handle = self.maybe_extend(slot, handle, now, &mut events).await;
                slot.update(&handle.id, |h| h.last_used = now);
                debug!(
                    "[cache] reusing {} ({} tokens, {} item(s) covered)",
                    handle.id,
                    handle.token_count,
                    handle.covered_items()
                );
                events.push(CacheEvent::Reused {
                    id: handle.id.clone(),
                    tokens: handle.token_count,
                });
                return PreparedRequest::cached(snapshot, &handle, events);
            }
            let reason = if handle.is_expired(now) {
                "expired"
            } else {
                "covered prefix changed"
            };
            self.invalidate(slot, &handle.id, reason);
            events.push(CacheEvent::Invalidated {
                id: handle.id,
                reason: reason.to_string(),
            });
        }

        let Some((covered_items, tokens)) = self.choose_prefix(snapshot, backend.min_tokens()) else {
            return PreparedRequest::uncached(snapshot, events);
        };

        match self.create(backend, snapshot, covered_items, tokens).await {
            Ok(handle) => {
                if slot.compare_and_swap(None, Some(handle.clone())) {
                    info!(
                        "[cache] created {} covering {tokens} tokens ({covered_items} item(s))",
                        handle.id
                    );
                    events.push(CacheEvent::Created {
                        id: handle.id.clone(),
                        tokens,
                    });
                    PreparedRequest::cached(snapshot, &handle, events)
                } else {
                    // Someone else filled the slot meanwhile; ours is surplus.
                    self.invalidate(slot, &handle.id, "lost creation race");
                    PreparedRequest::uncached(snapshot, events)
                }
            }
            Err(e) => {
                warn!("[cache] creation failed, continuing uncached: {e}");
                events.push(CacheEvent::Failed {
                    reason: e.to_string(),
                });
                PreparedRequest::uncached(snapshot, events)
            }
        }
    }

    /// Pick the prefix to cache: the pinned instruction when it alone is big
    /// enough, otherwise (if enabled) everything before the newest unit.
    /// Returns (covered items, tokens).
    fn choose_prefix(&self, snapshot: &ContextSnapshot, backend_min: usize) -> Option<(usize, usize)> {
        let minimum = self.config.min_tokens.max(backend_min);
        let instruction = snapshot.pinned_instruction.tokens;
        if instruction >= minimum {
            return Some((0, instruction));
        }
        if !self.config.cache_conversation {
            return None;
        }
        let covered = snapshot.newest_unit_start;
        let tokens = instruction
            + snapshot.items[..covered]
                .iter()
                .map(|i| i.tokens)
                .sum::<usize>();
        (covered > 0 && tokens >= minimum).then_some((covered, tokens))
    }

    async fn create(
        &self,
        backend: &Arc<dyn CacheBackend>,
        snapshot: &ContextSnapshot,
        covered_items: usize,
        tokens: usize,
    ) -> Result<CacheHandle, CacheError> {
        let covers = PrefixFingerprint::of(snapshot, covered_items);
        let request = CacheCreateRequest {
            model: self.model.clone(),
            display_name: format!(
                "{DISPLAY_PREFIX}-{}",
                covers.combined.get(..12).unwrap_or(&covers.combined)
            ),
            pinned_instruction: snapshot.pinned_instruction.text.clone(),
            items: snapshot.items[..covered_items].to_vec(),
            token_count: tokens,
            ttl: self.config.ttl,
        };
        let remote = tokio::time::timeout(self.config.create_timeout, backend.create(&request))
            .await
            .map_err(|_| CacheError::Timeout(self.config.create_timeout))??;

        self.owned_map().insert(remote.id.clone(), true);
        Ok(CacheHandle {
            id: remote.id,
            covers,
            token_count: remote.token_count,
            expires_at: remote.expires_at,
            last_used: Instant::now(),
        })
    }

    /// Extend `handle` if it is close to expiry. Extension failure keeps the
    /// handle as long as it has not expired.
    async fn maybe_extend(
        &self,
        slot: &CacheSlot,
        handle: CacheHandle,
        now: Instant,
        events: &mut Vec<CacheEvent>,
    ) -> CacheHandle {
        if handle.remaining(now) >= self.config.extend_threshold {
            return handle;
        }
        match self.extend(slot, &handle).await {
            Ok(expires_at) => {
                events.push(CacheEvent::Extended {
                    id: handle.id.clone(),
                });
                CacheHandle {
                    expires_at,
                    ..handle
                }
            }
            Err(e) => {
                warn!("[cache] extending {} failed: {e}", handle.id);
                handle
            }
        }
    }

    async fn extend(&self, slot: &CacheSlot, handle: &CacheHandle) -> Result<Instant, CacheError> {
        let backend = self
            .backend
            .as_ref()
            .ok_or_else(|| CacheError::Backend("caching disabled".into()))?;
        let expires_at = tokio::time::timeout(
            self.config.create_timeout,
            backend.extend(&handle.id, self.config.extended_ttl),
        )
        .await
        .map_err(|_| CacheError::Timeout(self.config.create_timeout))??;
        slot.update(&handle.id, |h| h.expires_at = expires_at);
        debug!("[cache] extended {}", handle.id);
        Ok(expires_at)
    }

    /// Drop the slot's handle if it is `id`, and delete it remotely in the
    /// background.
    fn invalidate(&self, slot: &CacheSlot, id: &str, reason: &str) {
        slot.compare_and_swap(Some(id), None);
        info!("[cache] invalidated {id}: {reason}");
        self.delete_in_background(id.to_string());
    }

    fn delete_in_background(&self, id: String) {
        if let Some(held) = self.owned_map().get_mut(&id) {
            *held = false;
        }
        let Some(backend) = self.backend.clone() else {
            return;
        };
        let owned = Arc::clone(&self.owned);
        tokio::spawn(async move {
            match backend.delete(&id).await {
                Ok(()) | Err(CacheError::NotFound(_)) => {
                    owned.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                }
                Err(e) => debug!("[cache] deleting {id} failed, left for garbage collection: {e}"),
            }
        });
    }

    /// One renewal pass: extend the slot's handle if it is near expiry.
    /// Returns whether an extension happened.
    pub async fn renew(&self, slot: &CacheSlot) -> bool {
        let now = Instant::now();
        let Some(handle) = slot.get() else {
            return false;
        };
        if handle.is_expired(now) || handle.remaining(now) >= self.config.extend_threshold {
            return false;
        }
        match self.extend(slot, &handle).await {
            Ok(_) => true,
            Err(e) => {
                warn!("[cache] background renewal of {} failed: {e}", handle.id);
                false
            }
        }
    }

    /// Keep the slot's handle alive between calls until `token` is cancelled.
    pub fn spawn_renewal(&self, slot: CacheSlot, token: CancellationToken) -> JoinHandle<()> {
        let coordinator = self.clone();
        let interval = self.config.renewal_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        coordinator.renew(&slot).await;
                    }
                }
            }
        })
    }

    /// Drop the slot's handle and delete it remotely.
    pub async fn release(&self, slot: &CacheSlot) {
        let Some(handle) = slot.take() else {
            return;
        };
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        match backend.delete(&handle.id).await {
            Ok(()) | Err(CacheError::NotFound(_)) => {
                self.owned_map().remove(&handle.id);
                debug!("[cache] released {}", handle.id);
            }
            Err(e) => {
                if let Some(held) = self.owned_map().get_mut(&handle.id) {
                    *held = false;
                }
                warn!("[cache] releasing {} failed: {e}", handle.id);
            }
        }
    }

    /// Delete remote caches this coordinator created that are expired or no
    /// longer held by any session. Returns how many were deleted.
    pub async fn garbage_collect(&self) -> Result<usize, CacheError> {
        let Some(backend) = self.backend.as_ref() else {
            return Ok(0);
        };
        let now = Instant::now();
        let remote = backend.list().await?;
        let doomed: Vec<String> = {
            let owned = self.owned_map();
            remote
                .iter()
                .filter(|c| c.display_name.starts_with(DISPLAY_PREFIX))
                .filter(|c| match owned.get(&c.id) {
                    Some(held) => !held || now >= c.expires_at,
                    None => false,
                })
                .map(|c| c.id.clone())
                .collect()
        };

        let mut deleted = 0;
        for id in doomed {
            match backend.delete(&id).await {
                Ok(()) | Err(CacheError::NotFound(_)) => {
                    self.owned_map().remove(&id);
                    deleted += 1;
                }
                Err(e) => warn!("[cache] garbage collection could not delete {id}: {e}"),
            }
        }
        if deleted > 0 {
            info!("[cache] garbage collected {deleted} cache(s)");
        }
        Ok(deleted)
    }

    fn owned_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, bool>> {
        self.owned.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheBackend;
    use crate::context::{ContextBudget, ContextWindowManager, TokenEstimator};
    use crate::history::{Role, Turn, TurnContent};

    fn manager() -> ContextWindowManager {
        ContextWindowManager::new(ContextBudget::new(100_000).with_safety_margin(0))
            .with_estimator(TokenEstimator::new(1.0))
    }

    fn turns(texts: &[&str]) -> Vec<Turn> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                Turn::new(i as u64, role, TurnContent::text(*t), t.chars().count())
            })
            .collect()
    }

    fn setup(min: usize, config: CacheConfig) -> (Arc<InMemoryCacheBackend>, CacheCoordinator) {
        let backend = Arc::new(InMemoryCacheBackend::new(min));
        let coordinator = CacheCoordinator::new(backend.clone(), config.with_min_tokens(min), "m");
        (backend, coordinator)
    }

    #[tokio::test]
    async fn large_instruction_is_cached_then_reused() {
        let (backend, coordinator) = setup(100, CacheConfig::default());
        let slot = CacheSlot::new();
        let pinned = "x".repeat(150);

        let first = manager().compose(&pinned, None, &turns(&["hello"])).unwrap();
        let prepared = coordinator.prepare(&slot, &first).await;
        assert!(prepared.cache_ref.is_some());
        assert!(prepared.pinned_instruction.is_none());
        assert_eq!(prepared.items.len(), 1);
        assert_eq!(prepared.telemetry.cached_tokens, 150);
        assert_eq!(prepared.telemetry.fresh_tokens, 5);

        let second = manager()
            .compose(&pinned, None, &turns(&["hello", "hi", "more"]))
            .unwrap();
        let again = coordinator.prepare(&slot, &second).await;
        assert_eq!(again.cache_ref, prepared.cache_ref);
        assert!(matches!(again.events[0], CacheEvent::Reused { .. }));
        assert_eq!(again.items.len(), 3);
        assert_eq!(backend.create_count(), 1);
    }

    #[tokio::test]
    async fn small_prefix_is_not_cached() {
        let (backend, coordinator) = setup(100, CacheConfig::default());
        let slot = CacheSlot::new();
        let snap = manager().compose("short", None, &turns(&["hello"])).unwrap();
        let prepared = coordinator.prepare(&slot, &snap).await;
        assert!(prepared.cache_ref.is_none());
        assert_eq!(prepared.pinned_instruction.as_deref(), Some("short"));
        assert_eq!(prepared.telemetry.cached_tokens, 0);
        assert_eq!(backend.create_count(), 0);
    }

    #[tokio::test]
    async fn conversation_prefix_when_enabled() {
        let (_, coordinator) = setup(20, CacheConfig::default().with_cache_conversation(true));
        let slot = CacheSlot::new();
        let long = "y".repeat(30);
        let snap = manager()
            .compose("sys", None, &turns(&[&long, "ok", "next"]))
            .unwrap();
        let prepared = coordinator.prepare(&slot, &snap).await;
        assert!(prepared.cache_ref.is_some());
        // Newest unit ("next") stays fresh.
        assert_eq!(prepared.items.len(), 1);
        assert_eq!(slot.get().map(|h| h.covered_items()), Some(2));
    }

    #[tokio::test]
    async fn mutated_prefix_invalidates_before_attach() {
        let (_, coordinator) = setup(20, CacheConfig::default().with_cache_conversation(true));
        let slot = CacheSlot::new();
        let long = "y".repeat(30);
        let snap = manager()
            .compose("sys", None, &turns(&[&long, "ok", "next"]))
            .unwrap();
        let first_id = coordinator.prepare(&slot, &snap).await.cache_ref;

        // Summary replaced the covered turns.
        let summarized = manager()
            .compose("sys", Some("they talked"), &turns(&["next"]))
            .unwrap();
        let prepared = coordinator.prepare(&slot, &summarized).await;
        assert!(matches!(
            prepared.events[0],
            CacheEvent::Invalidated { .. }
        ));
        assert_ne!(prepared.cache_ref, first_id);
        if let Some(handle) = slot.get() {
            assert!(handle.is_valid_for(&summarized, Instant::now()));
        }
    }

    #[tokio::test]
    async fn expired_handle_is_replaced() {
        let (backend, coordinator) = setup(10, CacheConfig::default());
        let slot = CacheSlot::new();
        let pinned = "p".repeat(20);
        let snap = manager().compose(&pinned, None, &[]).unwrap();
        let first = coordinator.prepare(&slot, &snap).await.cache_ref.unwrap();

        backend.expire(&first);
        slot.update(&first, |h| h.expires_at = Instant::now());
        let prepared = coordinator.prepare(&slot, &snap).await;
        assert!(matches!(
            &prepared.events[0],
            CacheEvent::Invalidated { reason, .. } if reason == "expired"
        ));
        assert!(prepared.cache_ref.is_some_and(|id| id != first));
    }

    #[tokio::test]
    async fn near_expiry_handle_is_extended() {
        let config = CacheConfig::default()
            .with_ttl(Duration::from_secs(30))
            .with_extend_threshold(Duration::from_secs(60));
        let (backend, coordinator) = setup(10, config);
        let slot = CacheSlot::new();
        let snap = manager().compose(&"p".repeat(20), None, &[]).unwrap();
        coordinator.prepare(&slot, &snap).await;
        let prepared = coordinator.prepare(&slot, &snap).await;
        assert!(matches!(prepared.events[0], CacheEvent::Extended { .. }));
        assert_eq!(backend.extend_count(), 1);
        assert!(
            slot.get()
                .is_some_and(|h| h.remaining(Instant::now()) > Duration::from_secs(500))
        );
    }

    #[tokio::test]
    async fn creation_failure_degrades_to_uncached() {
        let (backend, coordinator) = setup(10, CacheConfig::default());
        backend.set_fail_creates(true);
        let slot = CacheSlot::new();
        let snap = manager().compose(&"p".repeat(20), None, &[]).unwrap();
        let prepared = coordinator.prepare(&slot, &snap).await;
        assert!(prepared.cache_ref.is_none());
        assert!(matches!(prepared.events[0], CacheEvent::Failed { .. }));
        assert_eq!(prepared.items, snap.items);
        assert!(slot.get().is_none());
    }

    #[tokio::test]
    async fn creation_timeout_degrades_to_uncached() {
        let backend = Arc::new(
            InMemoryCacheBackend::new(10).with_create_delay(Duration::from_millis(200)),
        );
        let coordinator = CacheCoordinator::new(
            backend,
            CacheConfig::default()
                .with_min_tokens(10)
                .with_create_timeout(Duration::from_millis(20)),
            "m",
        );
        let slot = CacheSlot::new();
        let snap = manager().compose(&"p".repeat(20), None, &[]).unwrap();
        let prepared = coordinator.prepare(&slot, &snap).await;
        assert!(prepared.cache_ref.is_none());
    }

    #[tokio::test]
    async fn disabled_sends_everything_fresh() {
        let coordinator = CacheCoordinator::disabled();
        let slot = CacheSlot::new();
        let snap = manager()
            .compose(&"p".repeat(5000), None, &turns(&["hi"]))
            .unwrap();
        let prepared = coordinator.prepare(&slot, &snap).await;
        assert!(prepared.cache_ref.is_none());
        assert_eq!(prepared.telemetry.fresh_tokens, snap.total_tokens);
        assert!(prepared.events.is_empty());
    }

    #[test]
    fn slot_compare_and_swap_checks_id() {
        let slot = CacheSlot::new();
        let snap = manager().compose("sys", None, &[]).unwrap();
        let now = Instant::now();
        let handle = CacheHandle {
            id: "a".into(),
            covers: PrefixFingerprint::of(&snap, 0),
            token_count: 3,
            expires_at: now + Duration::from_secs(10),
            last_used: now,
        };
        assert!(slot.compare_and_swap(None, Some(handle.clone())));
        assert!(!slot.compare_and_swap(None, Some(handle.clone())));
        assert!(!slot.compare_and_swap(Some("b"), None));
        assert!(slot.compare_and_swap(Some("a"), None));
        assert!(slot.get().is_none());
    }

    #[tokio::test]
    async fn release_and_garbage_collect() {
        let (backend, coordinator) = setup(10, CacheConfig::default());
        let snap = manager().compose(&"p".repeat(20), None, &[]).unwrap();

        let kept = CacheSlot::new();
        coordinator.prepare(&kept, &snap).await;
        let released = CacheSlot::new();
        let released_id = {
            // Different instruction so a second cache is created.
            let other = manager().compose(&"q".repeat(20), None, &[]).unwrap();
            coordinator.prepare(&released, &other).await.cache_ref.unwrap()
        };
        coordinator.release(&released).await;
        assert!(!backend.contains(&released_id));

        // An abandoned cache: owned but no longer held by any slot.
        let orphan = CacheSlot::new();
        let third = manager().compose(&"r".repeat(20), None, &[]).unwrap();
        let orphan_id = coordinator.prepare(&orphan, &third).await.cache_ref.unwrap();
        if let Some(held) = coordinator.owned_map().get_mut(&orphan_id) {
            *held = false;
        }

        assert_eq!(coordinator.garbage_collect().await.unwrap(), 1);
        assert!(!backend.contains(&orphan_id));
        assert!(backend.contains(&kept.current_id().unwrap()));
    }

    #[tokio::test]
    async fn renewal_task_extends_between_calls() {
        let config = CacheConfig::default()
            .with_ttl(Duration::from_secs(30))
            .with_extend_threshold(Duration::from_secs(60))
            .with_renewal_interval(Duration::from_millis(10));
        let (backend, coordinator) = setup(10, config);
        let slot = CacheSlot::new();
        let snap = manager().compose(&"p".repeat(20), None, &[]).unwrap();
        coordinator.prepare(&slot, &snap).await;

        let token = CancellationToken::new();
        let task = coordinator.spawn_renewal(slot.clone(), token.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;
        token.cancel();
        task.await.unwrap();
        assert!(backend.extend_count() >= 1);
    }
}
