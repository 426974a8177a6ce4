//! Events and handlers for the [`AgentRuntime`](super::AgentRuntime).
//!
//! The runtime reports the full lifecycle of every session through
//! [`RuntimeEvent`] values: state transitions, context reductions, cache
//! decisions, tool execution, token usage and the final outcome. Callers
//! implement [`EventHandler`] to observe them for logging, metrics, or UI.
//!
//! # Choosing an event handler
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures that may stop the session |
//! | [`EventObserver`] | Quick closures that only observe |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |
//! | Custom `impl EventHandler` | Full control |

use tracing::{debug, info, trace, warn};

use super::state::LoopState;
use crate::api::Usage;
use crate::cache::CacheEvent;
use crate::context::ContextUsage;
use crate::error::RuntimeError;

// ── Events ─────────────────────────────────────────────────────────

/// Events emitted by the runtime during a session.
#[derive(Debug)]
pub enum RuntimeEvent<'a> {
    SessionStarted {
        session_id: &'a str,
        tools: usize,
        pinned_tokens: usize,
        /// Memory documents injected into the pinned instruction.
        documents: usize,
    },
    /// A new iteration is about to call the model.
    IterationStart {
        session_id: &'a str,
        iteration: u32,
        max_iterations: u32,
        context_usage: &'a ContextUsage,
    },
    StateChanged { from: LoopState, to: LoopState },
    /// The snapshot left out or shortened some turns.
    ContextReduced {
        dropped_units: usize,
        truncated_turns: usize,
    },
    /// Aged turns were folded into the running summary.
    Summarized { compaction: u32, boundary: u64 },
    /// The summarization side call failed; truncation covers the budget.
    SummarizationFailed { reason: &'a str },
    Cache(&'a CacheEvent),
    /// The model returned text (final or alongside tool calls).
    Text(&'a str),
    ToolCallsReceived { iteration: u32, count: usize },
    ToolExecuting { name: &'a str, arguments: &'a str },
    ToolResult {
        name: &'a str,
        call_id: &'a str,
        result: &'a str,
        is_error: bool,
    },
    TokenUsage(&'a Usage),
    Finished {
        session_id: &'a str,
        iterations: u32,
        length_limited: bool,
    },
    Aborted {
        session_id: &'a str,
        error: &'a RuntimeError,
    },
}

impl RuntimeEvent<'_> {
    /// Total tokens from a `TokenUsage` event.
    pub fn total_tokens(&self) -> Option<u64> {
        if let RuntimeEvent::TokenUsage(usage) = self {
            Some(u64::from(usage.input_tokens()) + u64::from(usage.output_tokens))
        } else {
            None
        }
    }
}

/// Response from an event handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventResponse {
    /// Stop the session at the next safe boundary, as if the caller had
    /// cancelled it.
    Cancel,
}

/// Handler for runtime events.
///
/// Most handlers only observe and return `None`. Returning
/// `Some(EventResponse::Cancel)` stops the session at the next safe
/// boundary; a tool batch already running still completes and is recorded.
///
/// # Example
///
/// ```ignore
/// struct Budget;
///
/// impl EventHandler for Budget {
///     fn on_event(&self, event: &RuntimeEvent<'_>) -> Option<EventResponse> {
///         match event.total_tokens() {
///             Some(total) if total > 100_000 => Some(EventResponse::Cancel),
///             _ => None,
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &RuntimeEvent<'_>) -> Option<EventResponse> {
        let _ = event;
        None
    }
}

/// A no-op event handler.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| {
///     if let RuntimeEvent::Text(text) = event {
///         println!("{text}");
///     }
///     None
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&RuntimeEvent<'_>) -> Option<EventResponse> + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&RuntimeEvent<'_>) -> Option<EventResponse> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&RuntimeEvent<'_>) -> Option<EventResponse> + Send + Sync,
{
    fn on_event(&self, event: &RuntimeEvent<'_>) -> Option<EventResponse> {
        (self.0)(event)
    }
}

/// Wrapper that adapts an observation-only closure into an [`EventHandler`].
///
/// ```ignore
/// let handler = EventObserver::new(|event| {
///     if let RuntimeEvent::Text(t) = event { println!("{t}"); }
/// });
/// ```
pub struct EventObserver<F>(F)
where
    F: Fn(&RuntimeEvent<'_>) + Send + Sync;

impl<F> EventObserver<F>
where
    F: Fn(&RuntimeEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for EventObserver<F>
where
    F: Fn(&RuntimeEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &RuntimeEvent<'_>) -> Option<EventResponse> {
        (self.0)(event);
        None
    }
}

/// An event handler that delegates to multiple inner handlers.
///
/// Every handler sees every event, in registration order. The first
/// non-`None` response is returned.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with(my_metrics_handler);
/// ```
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add a handler to the chain. Handlers are called in registration order.
    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Conditionally add a handler to the chain.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &RuntimeEvent<'_>) -> Option<EventResponse> {
        let mut response = None;
        for handler in &self.handlers {
            let r = handler.on_event(event);
            if response.is_none() {
                response = r;
            }
        }
        response
    }
}

/// An event handler that logs events via `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &RuntimeEvent<'_>) -> Option<EventResponse> {
        match event {
            RuntimeEvent::SessionStarted {
                session_id,
                tools,
                pinned_tokens,
                documents,
            } => {
                info!(
                    "[{session_id}] session started: {tools} tool(s), {pinned_tokens} pinned tokens, {documents} memory document(s)"
                );
            }
            RuntimeEvent::IterationStart {
                session_id,
                iteration,
                max_iterations,
                context_usage,
            } => {
                info!(
                    "[{session_id}] [iteration {iteration}/{max_iterations}] {}",
                    context_usage.to_log_string()
                );
            }
            RuntimeEvent::StateChanged { from, to } => {
                trace!("State: {from} → {to}");
            }
            RuntimeEvent::ContextReduced {
                dropped_units,
                truncated_turns,
            } => {
                debug!("Context reduced: {dropped_units} unit(s) dropped, {truncated_turns} turn(s) truncated");
            }
            RuntimeEvent::Summarized {
                compaction,
                boundary,
            } => {
                info!("Context summarization #{compaction} completed (boundary at turn {boundary})");
            }
            RuntimeEvent::SummarizationFailed { reason } => {
                warn!("Summarization failed, continuing without it: {reason}");
            }
            RuntimeEvent::Cache(cache) => match cache {
                CacheEvent::Created { id, tokens } => info!("Cache created: {id} ({tokens} tokens)"),
                CacheEvent::Reused { id, tokens } => debug!("Cache reused: {id} ({tokens} tokens)"),
                CacheEvent::Extended { id } => debug!("Cache extended: {id}"),
                CacheEvent::Invalidated { id, reason } => info!("Cache invalidated: {id} ({reason})"),
                CacheEvent::Failed { reason } => warn!("Cache unavailable: {reason}"),
            },
            RuntimeEvent::Text(text) => {
                let preview: String = text.chars().take(200).collect();
                debug!(
                    "LLM text: {preview}{}",
                    if text.len() > 200 { "..." } else { "" }
                );
            }
            RuntimeEvent::ToolCallsReceived { iteration, count } => {
                debug!("{count} tool call(s) in iteration {iteration}");
            }
            RuntimeEvent::ToolExecuting { name, .. } => {
                debug!("Executing tool: {name}");
            }
            RuntimeEvent::ToolResult {
                name,
                result,
                is_error,
                ..
            } => {
                if *is_error {
                    debug!("Tool {name} failed: {result}");
                } else {
                    debug!("Tool {name} result: {} bytes", result.len());
                }
            }
            RuntimeEvent::TokenUsage(usage) => {
                debug!(
                    "Tokens: fresh={}, cached={}, output={}",
                    usage.fresh_input_tokens, usage.cached_input_tokens, usage.output_tokens
                );
            }
            RuntimeEvent::Finished {
                session_id,
                iterations,
                length_limited,
            } => {
                if *length_limited {
                    info!("[{session_id}] finished after {iterations} iteration(s) (output length limit hit)");
                } else {
                    info!("[{session_id}] finished after {iterations} iteration(s)");
                }
            }
            RuntimeEvent::Aborted { session_id, error } => {
                warn!("[{session_id}] aborted ({}): {error}", error.code());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn composite_calls_every_handler_and_keeps_first_response() {
        let seen = Arc::new(AtomicUsize::new(0));
        let s1 = seen.clone();
        let s2 = seen.clone();
        let handler = CompositeEventHandler::new()
            .with(EventObserver::new(move |_| {
                s1.fetch_add(1, Ordering::SeqCst);
            }))
            .with(FnEventHandler::new(|_| Some(EventResponse::Cancel)))
            .with(EventObserver::new(move |_| {
                s2.fetch_add(1, Ordering::SeqCst);
            }))
            .with_if(false, NoopHandler);

        let response = handler.on_event(&RuntimeEvent::Text("hi"));
        assert_eq!(response, Some(EventResponse::Cancel));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn total_tokens_only_for_usage() {
        let usage = Usage {
            fresh_input_tokens: 10,
            cached_input_tokens: 90,
            output_tokens: 5,
        };
        assert_eq!(RuntimeEvent::TokenUsage(&usage).total_tokens(), Some(105));
        assert_eq!(RuntimeEvent::Text("x").total_tokens(), None);
    }

    #[test]
    fn logging_handler_never_responds() {
        let err = RuntimeError::Cancelled;
        assert!(
            LoggingHandler
                .on_event(&RuntimeEvent::Aborted {
                    session_id: "ses-1",
                    error: &err
                })
                .is_none()
        );
    }
}
