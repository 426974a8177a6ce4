//! The agent loop controller and caller-facing API.
//!
//! [`AgentRuntime`] drives each session through the
//! [`LoopState`] machine:
//!
//! 1. **Boundary checks** — cancellation, the session deadline and the
//!    iteration ceiling are checked before every model call.
//! 2. **Summarization** — when enabled and due, aged turns are folded into
//!    the running summary by a side call.
//! 3. **Composition** — the [`ContextWindowManager`] builds a snapshot that
//!    fits the budget, or the run aborts with `ContextOverflow`.
//! 4. **Caching** — the [`CacheCoordinator`] attaches a valid handle and
//!    strips the content it covers.
//! 5. **Model call** — raced against cancellation and the session deadline,
//!    with its own timeout and transient-error retries.
//! 6. **Tools** — requested calls run (concurrently by default) and every
//!    result is committed before the next boundary.
//!
//! Sessions are independent. One runtime can drive many of them in
//! parallel; each session's loop is strictly sequential.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::RuntimeConfig;
use super::events::{EventHandler, EventResponse, NoopHandler, RuntimeEvent};
use super::session::{
    Renewal, RunOutcome, Session, SessionArchive, SessionHandle, SessionReport,
};
use super::state::LoopState;
use crate::ToolCall;
use crate::api::retry::retry_model_call;
use crate::api::tracing::{CostTracker, generate_session_id};
use crate::api::{ModelEndpoint, ModelRequest, ModelResponse, StopSignal, Usage};
use crate::cache::{CacheBackend, CacheCoordinator, CacheSlot};
use crate::context::{ContextWindowManager, Summarizer};
use crate::error::{CacheError, ModelError, RuntimeError};
use crate::history::{HistoryStore, Role, Turn, TurnContent};
use crate::memory::MemoryStore;
use crate::tools::{FailureTracker, ToolDispatcher, ToolRegistry};

const SUMMARY_TEMPERATURE: f32 = 0.3;

/// Drives sessions against one model endpoint.
///
/// # Example
///
/// ```ignore
/// let runtime = AgentRuntime::new(endpoint, config)
///     .with_cache_backend(backend)
///     .with_memory_store(Arc::new(FileMemoryStore::new(".tether/memory")))
///     .with_event_handler(Arc::new(LoggingHandler));
///
/// let session = runtime.start_session("You are a careful analyst.", tools).await?;
/// let outcome = runtime.run(&session, "Summarize the incident report").await?;
/// let report = runtime.end_session(session).await;
/// ```
#[derive(Clone)]
pub struct AgentRuntime {
    endpoint: Arc<dyn ModelEndpoint>,
    config: RuntimeConfig,
    cache: CacheCoordinator,
    memory: Option<Arc<dyn MemoryStore>>,
    events: Arc<dyn EventHandler>,
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field("memory", &self.memory.is_some())
            .finish()
    }
}

impl AgentRuntime {
    pub fn new(endpoint: Arc<dyn ModelEndpoint>, config: RuntimeConfig) -> Self {
        Self {
            endpoint,
            config,
            cache: CacheCoordinator::disabled(),
            memory: None,
            events: Arc::new(NoopHandler),
        }
    }

    /// Enable explicit prompt caching through `backend`. Ignored when the
    /// config's cache toggle is off.
    pub fn with_cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        if self.config.cache.enabled {
            self.cache = CacheCoordinator::new(
                backend,
                self.config.cache.config.clone(),
                self.config.model.clone(),
            );
        } else {
            debug!("[cache] backend supplied but caching is disabled in config");
        }
        self
    }

    pub fn with_memory_store(mut self, store: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(store);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.events = handler;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheCoordinator {
        &self.cache
    }

    // ── Session lifecycle ─────────────────────────────────────────

    /// Open a session with a pinned instruction and the tools the model may
    /// call. Memory documents named in the config are appended to the
    /// instruction.
    pub async fn start_session(
        &self,
        pinned_instruction: impl Into<String>,
        tools: Arc<ToolRegistry>,
    ) -> Result<SessionHandle, RuntimeError> {
        self.open(pinned_instruction.into(), tools, HistoryStore::new(), None)
            .await
    }

    /// Rebuild a session from an archive: a [`SessionReport`], or bare turns
    /// via `Vec<Turn>`. The turns must form a valid history that does not end
    /// with unanswered tool calls. An archived summary is restored with its
    /// boundary, which requires summarization to be enabled.
    pub async fn resume_session(
        &self,
        pinned_instruction: impl Into<String>,
        tools: Arc<ToolRegistry>,
        archive: impl Into<SessionArchive>,
    ) -> Result<SessionHandle, RuntimeError> {
        let archive = archive.into();
        let mut history = HistoryStore::new();
        for turn in archive.turns {
            history.append(turn).map_err(|e| {
                RuntimeError::Configuration(format!("archived history is invalid: {e}"))
            })?;
        }
        if !history.outstanding_calls().is_empty() {
            return Err(RuntimeError::Configuration(format!(
                "archived history ends with {} unanswered tool call(s)",
                history.outstanding_calls().len()
            )));
        }
        let restored = match archive.summary {
            Some(_) if !self.config.summarization.enabled => {
                return Err(RuntimeError::Configuration(
                    "archived session carries a summary but summarization is disabled".into(),
                ));
            }
            Some(_) if archive.summary_boundary > history.next_sequence() => {
                return Err(RuntimeError::Configuration(format!(
                    "summary boundary {} is past the archived history ({} turns)",
                    archive.summary_boundary,
                    history.len()
                )));
            }
            Some(summary) => Some((summary, archive.summary_boundary)),
            None => None,
        };
        info!(
            "Resuming session from {} archived turn(s){}",
            history.len(),
            if restored.is_some() { " with summary" } else { "" }
        );
        self.open(pinned_instruction.into(), tools, history, restored)
            .await
    }

    async fn open(
        &self,
        instruction: String,
        tools: Arc<ToolRegistry>,
        history: HistoryStore,
        restored: Option<(String, u64)>,
    ) -> Result<SessionHandle, RuntimeError> {
        self.config.validate()?;
        let (pinned, documents) = self.load_pinned(instruction).await;

        // The pinned content alone must fit, or no call could ever be made.
        let window = self.config.window_manager();
        let pinned_tokens = window.compose(&pinned, None, &[])?.pinned_instruction.tokens;

        let id = generate_session_id();
        let cancel = CancellationToken::new();
        let cache_slot = CacheSlot::new();
        let renewal = self.cache.is_enabled().then(|| {
            let token = cancel.child_token();
            let task = self.cache.spawn_renewal(cache_slot.clone(), token.clone());
            Renewal { token, task }
        });
        let dispatcher = ToolDispatcher::new(tools.clone())
            .with_timeout(self.config.tool_timeout)
            .with_max_result_bytes(self.config.max_result_bytes);
        let mut summarizer = self
            .config
            .summarization
            .enabled
            .then(|| Summarizer::new(self.config.summarization.config.clone()));
        if let (Some(summarizer), Some((summary, boundary))) = (summarizer.as_mut(), restored) {
            summarizer.restore(summary, boundary);
        }

        self.emit(
            &cancel,
            &RuntimeEvent::SessionStarted {
                session_id: &id,
                tools: tools.len(),
                pinned_tokens,
                documents,
            },
        );

        let session = Session {
            id: id.clone(),
            pinned,
            history,
            summarizer,
            cache_slot,
            state: LoopState::Idle,
            dispatcher,
            tool_defs: tools.definitions(),
            failures: FailureTracker::new(self.config.failure_threshold),
            cost: CostTracker::new(),
            usage: Usage::default(),
            iterations: 0,
            runs: 0,
            last_error: None,
            closed: false,
            renewal,
        };
        Ok(SessionHandle {
            id: id.into(),
            cancel,
            inner: Arc::new(Mutex::new(session)),
        })
    }

    /// Instruction followed by every non-empty memory document. Memory
    /// failures are logged and skipped.
    async fn load_pinned(&self, instruction: String) -> (String, usize) {
        let Some(store) = self.memory.as_ref() else {
            return (instruction, 0);
        };
        let mut pinned = instruction;
        let mut documents = 0;
        for key in &self.config.memory.load_keys {
            match store.get(key).await {
                Ok(Some(value)) if !value.trim().is_empty() => {
                    let _ = write!(pinned, "\n\n<memory key=\"{key}\">\n{}\n</memory>", value.trim());
                    documents += 1;
                }
                Ok(_) => debug!("[memory] no entry for '{key}'"),
                Err(e) => warn!("[memory] failed to load '{key}': {e}"),
            }
        }
        (pinned, documents)
    }

    /// Request cancellation. Honored at the next safe boundary; a running
    /// tool batch finishes and is recorded first.
    pub fn cancel(&self, handle: &SessionHandle) {
        if !handle.cancel.is_cancelled() {
            info!("[{}] cancellation requested", handle.id());
            handle.cancel.cancel();
        }
    }

    /// Close the session: stop background renewal, release the cache
    /// handle and write the summary (or last answer) to memory.
    pub async fn end_session(&self, handle: SessionHandle) -> SessionReport {
        handle.cancel.cancel();
        let mut session = handle.inner.lock().await;
        session.closed = true;
        if let Some(renewal) = session.renewal.take() {
            renewal.stop().await;
        }
        self.cache.release(&session.cache_slot).await;
        let memory_saved = self.save_memory(&session).await;

        info!("[{}] session ended: {}", session.id, session.cost.summary());
        SessionReport {
            session_id: session.id.clone(),
            state: session.state,
            runs: session.runs,
            iterations: session.iterations,
            usage: session.usage,
            cost: session.cost.clone(),
            summary: session.summary().map(str::to_string),
            summary_boundary: session.boundary(),
            error: session.last_error.clone(),
            memory_saved,
            history: session.history.turns().to_vec(),
        }
    }

    async fn save_memory(&self, session: &Session) -> bool {
        let (Some(store), Some(key)) = (self.memory.as_ref(), self.config.memory.save_key.as_ref())
        else {
            return false;
        };
        let Some(content) = session
            .summary()
            .or_else(|| session.history.last_assistant_text())
        else {
            debug!("[memory] nothing to save for session {}", session.id);
            return false;
        };
        match store.put(key, content.to_string()).await {
            Ok(()) => {
                debug!("[memory] saved {} bytes under '{key}'", content.len());
                true
            }
            Err(e) => {
                warn!("[memory] failed to save '{key}': {e}");
                false
            }
        }
    }

    /// Delete remote caches this runtime created that are expired or no
    /// longer held by a session.
    pub async fn garbage_collect_caches(&self) -> Result<usize, CacheError> {
        self.cache.garbage_collect().await
    }

    // ── Run loop ──────────────────────────────────────────────────

    /// Append `user_input` and loop until the model answers or the run
    /// aborts. An aborted session stays closed; later calls return
    /// [`RuntimeError::SessionClosed`].
    pub async fn run(
        &self,
        handle: &SessionHandle,
        user_input: impl Into<String>,
    ) -> Result<RunOutcome, RuntimeError> {
        let user_input = user_input.into();
        let mut guard = handle.inner.lock().await;
        let session = &mut *guard;
        if session.closed || session.state == LoopState::Aborted {
            return Err(RuntimeError::SessionClosed(session.id.clone()));
        }

        match self.drive(session, &handle.cancel, user_input).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                self.abort(session, &handle.cancel, &error).await;
                Err(error)
            }
        }
    }

    async fn drive(
        &self,
        session: &mut Session,
        cancel: &CancellationToken,
        user_input: String,
    ) -> Result<RunOutcome, RuntimeError> {
        let deadline = Instant::now() + self.config.session_timeout;
        let window = self.config.window_manager();
        let estimator = *window.estimator();
        let pricing = self.config.model_pricing();
        let max_iterations = self.config.max_iterations.get();
        let mut iterations = 0u32;
        let mut run_usage = Usage::default();

        self.check_boundary(cancel, deadline)?;
        append(session, Role::User, TurnContent::Text(user_input), &estimator)?;
        session.runs += 1;
        self.change_state(session, cancel, LoopState::Requesting)?;

        loop {
            self.check_boundary(cancel, deadline)?;
            if iterations >= max_iterations {
                return Err(RuntimeError::IterationBudgetExceeded {
                    max: max_iterations,
                });
            }

            self.summarize_if_due(session, cancel, deadline, &window, &mut run_usage)
                .await?;

            let snapshot = window.compose(
                &session.pinned,
                session.summary(),
                session.history.slice(session.boundary(), u64::MAX),
            )?;
            if snapshot.was_reduced() {
                self.emit(
                    cancel,
                    &RuntimeEvent::ContextReduced {
                        dropped_units: snapshot.dropped_units,
                        truncated_turns: snapshot.truncated_turns,
                    },
                );
            }

            iterations += 1;
            session.iterations += 1;
            self.emit(
                cancel,
                &RuntimeEvent::IterationStart {
                    session_id: &session.id,
                    iteration: iterations,
                    max_iterations,
                    context_usage: &snapshot.usage,
                },
            );

            let prepared = self.cache.prepare(&session.cache_slot, &snapshot).await;
            for event in &prepared.events {
                self.emit(cancel, &RuntimeEvent::Cache(event));
            }
            debug!(
                "[context] {} item(s), {} cached + {} fresh tokens",
                prepared.items.len(),
                prepared.telemetry.cached_tokens,
                prepared.telemetry.fresh_tokens
            );
            let request = ModelRequest {
                model: self.config.model.clone(),
                pinned_instruction: prepared.pinned_instruction,
                items: prepared.items,
                cache_ref: prepared.cache_ref,
                tools: session.tool_defs.clone(),
                max_output_tokens: self.config.max_output_tokens,
                temperature: self.config.temperature,
            };

            let response = self.call_model(&request, cancel, deadline).await?;
            session.usage.add(&response.usage);
            session.cost.record(&response.usage, &pricing);
            run_usage.add(&response.usage);
            self.emit(cancel, &RuntimeEvent::TokenUsage(&response.usage));

            let ModelResponse {
                text,
                tool_calls,
                stop,
                ..
            } = response;
            let text = text.filter(|t| !t.is_empty());
            if let Some(ref t) = text {
                self.emit(cancel, &RuntimeEvent::Text(t));
            }

            if tool_calls.is_empty() {
                let answer = text.unwrap_or_default();
                append(session, Role::Assistant, TurnContent::Text(answer.clone()), &estimator)?;
                self.change_state(session, cancel, LoopState::Done)?;
                let length_limited = stop == StopSignal::LengthLimited;
                if length_limited {
                    warn!("[{}] answer cut off at the output limit", session.id);
                }
                self.emit(
                    cancel,
                    &RuntimeEvent::Finished {
                        session_id: &session.id,
                        iterations,
                        length_limited,
                    },
                );
                self.change_state(session, cancel, LoopState::Idle)?;
                return Ok(RunOutcome {
                    answer,
                    iterations,
                    length_limited,
                    usage: run_usage,
                });
            }

            let calls = sanitize_call_ids(tool_calls, session.history.next_sequence());
            self.emit(
                cancel,
                &RuntimeEvent::ToolCallsReceived {
                    iteration: iterations,
                    count: calls.len(),
                },
            );
            append(
                session,
                Role::Assistant,
                TurnContent::ToolRequest {
                    text,
                    calls: calls.clone(),
                },
                &estimator,
            )?;
            self.change_state(session, cancel, LoopState::ToolPending)?;
            self.execute_tools(session, cancel, &calls, &estimator, deadline)
                .await?;
            self.change_state(session, cancel, LoopState::Requesting)?;
        }
    }

    /// Run one batch and commit every result in request order. Never raced
    /// with cancellation: the caller's boundary check follows. Calls still
    /// running at the session deadline end as timeouts.
    async fn execute_tools(
        &self,
        session: &mut Session,
        cancel: &CancellationToken,
        calls: &[ToolCall],
        estimator: &crate::context::TokenEstimator,
        deadline: Instant,
    ) -> Result<(), RuntimeError> {
        for call in calls {
            self.emit(
                cancel,
                &RuntimeEvent::ToolExecuting {
                    name: call.name(),
                    arguments: call.arguments(),
                },
            );
        }
        let outcomes = session
            .dispatcher
            .dispatch_all_before(calls, self.config.concurrent_tools, Some(deadline))
            .await;

        let mut exceeded = None;
        for (call, outcome) in calls.iter().zip(outcomes) {
            let streak = session.failures.record(&outcome, call.arguments());
            if exceeded.is_none() {
                exceeded = streak;
            }
            self.emit(
                cancel,
                &RuntimeEvent::ToolResult {
                    name: &outcome.tool_name,
                    call_id: &outcome.call_id,
                    result: &outcome.output(),
                    is_error: outcome.is_error(),
                },
            );
            append(session, Role::ToolResult, outcome.into_turn_content(), estimator)?;
        }

        match exceeded {
            Some(streak) => Err(RuntimeError::ToolFailureThresholdExceeded {
                tool: streak.tool,
                count: streak.count,
                error: streak.error,
            }),
            None => Ok(()),
        }
    }

    /// One model round trip: retries and the per-call timeout inside, raced
    /// against cancellation and the session deadline outside.
    async fn call_model(
        &self,
        request: &ModelRequest,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<ModelResponse, RuntimeError> {
        let timeout = self.config.model_call_timeout;
        let endpoint = &self.endpoint;
        let call = retry_model_call(&self.config.retry, move || {
            let pending = endpoint.complete(request);
            async move {
                tokio::time::timeout(timeout, pending)
                    .await
                    .unwrap_or_else(|_| Err(ModelError::Timeout(timeout)))
            }
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RuntimeError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                Err(RuntimeError::SessionTimedOut(self.config.session_timeout))
            }
            result = call => result.map_err(RuntimeError::Model),
        }
    }

    /// Fold aged turns into the running summary when due. A failed or
    /// timed-out summary is logged and skipped; truncation covers the
    /// budget instead.
    async fn summarize_if_due(
        &self,
        session: &mut Session,
        cancel: &CancellationToken,
        deadline: Instant,
        window: &ContextWindowManager,
        run_usage: &mut Usage,
    ) -> Result<(), RuntimeError> {
        let Some((request, to, timeout)) = plan_summary(session, window, &self.config.model) else {
            return Ok(());
        };
        debug!(
            "[context] summarizing turns {}..{to} for session {}",
            session.boundary(),
            session.id
        );

        let call = tokio::time::timeout(timeout, self.endpoint.complete(&request));
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(RuntimeError::SessionTimedOut(self.config.session_timeout));
            }
            result = call => result,
        };

        let failure = match result {
            Ok(Ok(response)) => {
                session.usage.add(&response.usage);
                session
                    .cost
                    .record(&response.usage, &self.config.model_pricing());
                run_usage.add(&response.usage);
                match response.text.filter(|t| !t.trim().is_empty()) {
                    Some(summary) => {
                        let compaction = session.summarizer.as_mut().map(|s| {
                            s.apply_summary(summary, to);
                            s.compactions()
                        });
                        self.emit(
                            cancel,
                            &RuntimeEvent::Summarized {
                                compaction: compaction.unwrap_or(0),
                                boundary: to,
                            },
                        );
                        return Ok(());
                    }
                    None => "model returned an empty summary".to_string(),
                }
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {timeout:?}"),
        };
        self.emit(
            cancel,
            &RuntimeEvent::SummarizationFailed { reason: &failure },
        );
        Ok(())
    }

    // ── Helpers ───────────────────────────────────────────────────

    fn check_boundary(
        &self,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<(), RuntimeError> {
        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        if Instant::now() >= deadline {
            return Err(RuntimeError::SessionTimedOut(self.config.session_timeout));
        }
        Ok(())
    }

    fn change_state(
        &self,
        session: &mut Session,
        cancel: &CancellationToken,
        next: LoopState,
    ) -> Result<(), RuntimeError> {
        let from = session.transition(next)?;
        self.emit(cancel, &RuntimeEvent::StateChanged { from, to: next });
        Ok(())
    }

    /// Forward an event; a handler asking to cancel trips the session token.
    fn emit(&self, cancel: &CancellationToken, event: &RuntimeEvent<'_>) {
        if let Some(EventResponse::Cancel) = self.events.on_event(event)
            && !cancel.is_cancelled()
        {
            info!("Event handler requested cancellation");
            cancel.cancel();
        }
    }

    async fn abort(&self, session: &mut Session, cancel: &CancellationToken, error: &RuntimeError) {
        let from = session.state;
        session.state = LoopState::Aborted;
        self.emit(
            cancel,
            &RuntimeEvent::StateChanged {
                from,
                to: LoopState::Aborted,
            },
        );
        self.emit(
            cancel,
            &RuntimeEvent::Aborted {
                session_id: &session.id,
                error,
            },
        );
        session.last_error = Some(error.clone());
        if let Some(renewal) = session.renewal.take() {
            renewal.stop().await;
        }
        self.cache.release(&session.cache_slot).await;
    }
}

/// Build the summarization request if one is due: (request, new boundary,
/// timeout).
fn plan_summary(
    session: &Session,
    window: &ContextWindowManager,
    main_model: &str,
) -> Option<(ModelRequest, u64, std::time::Duration)> {
    let summarizer = session.summarizer.as_ref()?;
    let turns = session.history.slice(summarizer.boundary(), u64::MAX);
    let over_ceiling =
        window.raw_tokens(&session.pinned, summarizer.summary(), turns) > window.budget().ceiling();
    if !summarizer.should_summarize(turns.len(), over_ceiling) {
        return None;
    }
    let plan = summarizer.plan(turns)?;
    let (system, user) =
        summarizer.build_summarization_request(session.history.slice(plan.from, plan.to));
    let config = summarizer.config();
    let request = ModelRequest::single_turn(
        summarizer.summary_model(main_model),
        system,
        user,
        config.max_summary_tokens,
        SUMMARY_TEMPERATURE,
    );
    Some((request, plan.to, config.timeout))
}

fn append(
    session: &mut Session,
    role: Role,
    content: TurnContent,
    estimator: &crate::context::TokenEstimator,
) -> Result<(), RuntimeError> {
    let tokens = estimator.estimate_content(&content);
    let sequence = session.history.next_sequence();
    session
        .history
        .append(Turn::new(sequence, role, content, tokens))
        .map_err(|e| {
            error!("[history] controller produced an invalid turn: {e}");
            debug_assert!(false, "controller produced an invalid turn: {e}");
            RuntimeError::from(e)
        })
}

/// Give every call a non-empty id unique within the batch.
fn sanitize_call_ids(calls: Vec<ToolCall>, sequence: u64) -> Vec<ToolCall> {
    let mut seen = HashSet::new();
    calls
        .into_iter()
        .enumerate()
        .map(|(i, mut call)| {
            if call.id.trim().is_empty() || seen.contains(&call.id) {
                let id = format!("call-{sequence}-{i}");
                debug!("[tool] replacing call id '{}' with '{id}'", call.id);
                call.id = id;
            }
            seen.insert(call.id.clone());
            call
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ScriptedEndpoint;
    use crate::cache::{CacheConfig, InMemoryCacheBackend};
    use crate::context::SummarizerConfig;
    use crate::agent::{MemoryConfig, Toggle};
    use crate::memory::InMemoryStore;
    use crate::tools::FnTool;
    use crate::{ToolDef, json_schema_for};
    use schemars::JsonSchema;
    use serde::Deserialize;
    use std::num::NonZeroU32;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Deserialize, JsonSchema)]
    struct EchoArgs {
        value: String,
    }

    fn echo_tools() -> Arc<ToolRegistry> {
        Arc::new(
            ToolRegistry::new()
                .with(FnTool::new(
                    ToolDef::new("echo", "Echo a value", json_schema_for::<EchoArgs>()),
                    |args: EchoArgs| async move { Ok(args.value) },
                ))
                .unwrap(),
        )
    }

    fn config(max: u32) -> RuntimeConfig {
        RuntimeConfig::new("test-model", NonZeroU32::new(max).unwrap()).with_retries(0)
    }

    fn runtime(endpoint: ScriptedEndpoint, config: RuntimeConfig) -> (AgentRuntime, Arc<ScriptedEndpoint>) {
        let endpoint = Arc::new(endpoint);
        (AgentRuntime::new(endpoint.clone(), config), endpoint)
    }

    #[tokio::test]
    async fn text_answer_completes_in_one_iteration() {
        let (rt, endpoint) = runtime(
            ScriptedEndpoint::new().then(ModelResponse::text("hello there")),
            config(3),
        );
        let session = rt.start_session("Be brief.", echo_tools()).await.unwrap();
        let outcome = rt.run(&session, "hi").await.unwrap();

        assert_eq!(outcome.answer, "hello there");
        assert_eq!(outcome.iterations, 1);
        assert!(!outcome.length_limited);
        assert_eq!(session.state().await, LoopState::Idle);
        assert_eq!(session.history().await.len(), 2);

        let sent = endpoint.requests();
        assert_eq!(sent[0].pinned_instruction.as_deref(), Some("Be brief."));
        assert_eq!(sent[0].tools.len(), 1);
    }

    #[tokio::test]
    async fn tool_round_trip_then_answer() {
        let (rt, endpoint) = runtime(
            ScriptedEndpoint::new()
                .then(ModelResponse::tool_calls(vec![ToolCall::new(
                    "c1",
                    "echo",
                    r#"{"value":"ping"}"#,
                )]))
                .then(ModelResponse::text("got ping")),
            config(5),
        );
        let session = rt.start_session("sys", echo_tools()).await.unwrap();
        let outcome = rt.run(&session, "echo ping").await.unwrap();
        assert_eq!(outcome.iterations, 2);

        let history = session.history().await;
        assert_eq!(history.len(), 4);
        assert!(history[1].is_tool_request());
        match history[2].content() {
            TurnContent::ToolResult { output, error, .. } => {
                assert_eq!(output, "ping");
                assert!(error.is_none());
            }
            other => panic!("expected tool result, got {other:?}"),
        }
        // The second call carries the whole exchange.
        assert_eq!(endpoint.requests()[1].items.len(), 3);
    }

    #[tokio::test]
    async fn length_limited_answer_is_flagged() {
        let (rt, _) = runtime(
            ScriptedEndpoint::new()
                .then(ModelResponse::text("partial").with_stop(StopSignal::LengthLimited)),
            config(2),
        );
        let session = rt.start_session("sys", echo_tools()).await.unwrap();
        let outcome = rt.run(&session, "long question").await.unwrap();
        assert!(outcome.length_limited);
        assert_eq!(outcome.answer, "partial");
    }

    #[tokio::test]
    async fn model_errors_abort_and_close_the_session() {
        let (rt, _) = runtime(
            ScriptedEndpoint::new().then_error(ModelError::Authentication("bad key".into())),
            config(2),
        );
        let session = rt.start_session("sys", echo_tools()).await.unwrap();
        let err = rt.run(&session, "hi").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Model(ModelError::Authentication(_))));
        assert_eq!(session.state().await, LoopState::Aborted);

        let again = rt.run(&session, "hi again").await.unwrap_err();
        assert_eq!(again.code(), "SESSION_CLOSED");
    }

    #[tokio::test]
    async fn duplicate_call_ids_are_rewritten() {
        let calls = sanitize_call_ids(
            vec![
                ToolCall::new("a", "echo", "{}"),
                ToolCall::new("a", "echo", "{}"),
                ToolCall::new("", "echo", "{}"),
            ],
            7,
        );
        let ids: Vec<&str> = calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["a", "call-7-1", "call-7-2"]);
    }

    #[tokio::test]
    async fn event_handler_can_cancel() {
        let (rt, endpoint) = runtime(
            ScriptedEndpoint::new()
                .then(ModelResponse::tool_calls(vec![ToolCall::new(
                    "c1",
                    "echo",
                    r#"{"value":"x"}"#,
                )]))
                .then(ModelResponse::text("never sent")),
            config(5),
        );
        let rt = rt.with_event_handler(Arc::new(crate::agent::FnEventHandler::new(|event| {
            matches!(event, RuntimeEvent::ToolResult { .. }).then_some(EventResponse::Cancel)
        })));
        let session = rt.start_session("sys", echo_tools()).await.unwrap();
        let err = rt.run(&session, "go").await.unwrap_err();
        assert_eq!(err, RuntimeError::Cancelled);
        assert_eq!(endpoint.call_count(), 1);
        // The tool result was committed before the abort.
        assert_eq!(session.history().await.len(), 3);
    }

    #[tokio::test]
    async fn summarization_folds_aged_turns() {
        let summaries = Arc::new(AtomicUsize::new(0));
        let counter = summaries.clone();
        let endpoint = ScriptedEndpoint::new().with_responder(move |req, _| {
            let is_summary = req.tools.is_empty()
                && req
                    .pinned_instruction
                    .as_deref()
                    .is_some_and(|p| p != "sys");
            if is_summary {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(ModelResponse::text("the user greeted several times"))
            } else {
                Ok(ModelResponse::text("ok"))
            }
        });
        let config = config(3).with_summarization(Toggle::enabled(
            SummarizerConfig::default()
                .with_trigger_turns(4)
                .with_retain_recent_turns(2),
        ));
        let (rt, _) = runtime(endpoint, config);
        let session = rt.start_session("sys", echo_tools()).await.unwrap();
        for i in 0..4 {
            rt.run(&session, format!("hello {i}")).await.unwrap();
        }
        assert!(summaries.load(Ordering::SeqCst) >= 1);
        assert_eq!(
            session.summary().await.as_deref(),
            Some("the user greeted several times")
        );
        // History is never rewritten.
        assert_eq!(session.history().await.len(), 8);
    }

    #[tokio::test]
    async fn memory_documents_are_pinned_and_answer_saved() {
        let store = Arc::new(InMemoryStore::new().with_entry("facts", "The project is called Tern."));
        let config = config(2).with_memory(MemoryConfig {
            load_keys: vec!["facts".into(), "missing".into()],
            save_key: Some("last".into()),
        });
        let (rt, endpoint) = runtime(
            ScriptedEndpoint::new().then(ModelResponse::text("It is called Tern.")),
            config,
        );
        let rt = rt.with_memory_store(store.clone());
        let session = rt.start_session("sys", echo_tools()).await.unwrap();
        rt.run(&session, "What is the project called?").await.unwrap();

        let pinned = endpoint.requests()[0].pinned_instruction.clone().unwrap();
        assert!(pinned.starts_with("sys"));
        assert!(pinned.contains("<memory key=\"facts\">"));

        let report = rt.end_session(session).await;
        assert!(report.memory_saved);
        assert_eq!(store.snapshot("last").as_deref(), Some("It is called Tern."));
    }

    #[tokio::test]
    async fn pinned_instruction_over_ceiling_is_rejected() {
        let config = config(2)
            .with_context_window(200)
            .with_output_reserve(50)
            .with_safety_margin(0);
        let (rt, _) = runtime(ScriptedEndpoint::new(), config);
        let err = rt
            .start_session("x".repeat(1000), echo_tools())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION");
    }

    #[tokio::test]
    async fn resume_rejects_unanswered_calls() {
        let (rt, _) = runtime(ScriptedEndpoint::new(), config(2));
        let turns = vec![
            Turn::new(0, Role::User, TurnContent::text("go"), 1),
            Turn::new(
                1,
                Role::Assistant,
                TurnContent::ToolRequest {
                    text: None,
                    calls: vec![ToolCall::new("c1", "echo", "{}")],
                },
                1,
            ),
        ];
        let err = rt.resume_session("sys", echo_tools(), turns).await.unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION");
    }

    #[tokio::test]
    async fn end_session_releases_cache() {
        let backend = Arc::new(InMemoryCacheBackend::new(10));
        let config = config(2).with_cache(Toggle::enabled(CacheConfig::default().with_min_tokens(10)));
        let (rt, _) = runtime(
            ScriptedEndpoint::new().then(ModelResponse::text("done")),
            config,
        );
        let rt = rt.with_cache_backend(backend.clone());
        let session = rt.start_session("a".repeat(400), echo_tools()).await.unwrap();
        rt.run(&session, "hi").await.unwrap();
        assert!(session.cache_id().await.is_some());
        assert_eq!(backend.len(), 1);

        let report = rt.end_session(session).await;
        assert_eq!(report.runs, 1);
        assert_eq!(backend.len(), 0);
    }
}
