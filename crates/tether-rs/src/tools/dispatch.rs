//! Tool dispatch: every requested call produces exactly one outcome.
//!
//! Unknown names, malformed or schema-invalid input, tool errors, panics and
//! timeouts all become [`ToolFailure`] values. None of them escape as an
//! `Err`; the loop controller turns each outcome into a tool-result turn the
//! model can react to.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::join_all;
use tracing::{debug, info, trace, warn};

use crate::ToolCall;
use crate::history::{ToolErrorKind, TurnContent};

use super::core::{
    DEFAULT_MAX_RESULT_BYTES, DEFAULT_TOOL_TIMEOUT, ToolRegistry, log_tool_call, truncate_result,
};

/// Point in time after which no tool call may keep running.
pub type Deadline = tokio::time::Instant;

/// Why a tool call produced no output.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolFailure {
    #[error("no tool named '{0}' is registered")]
    UnknownTool(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    ExecutionFailed(String),
    #[error("tool did not finish within {0:?}")]
    Timeout(Duration),
}

impl ToolFailure {
    pub fn kind(&self) -> ToolErrorKind {
        match self {
            ToolFailure::UnknownTool(_) => ToolErrorKind::UnknownTool,
            ToolFailure::InvalidInput(_) => ToolErrorKind::InvalidToolInput,
            ToolFailure::ExecutionFailed(_) => ToolErrorKind::ExecutionFailed,
            ToolFailure::Timeout(_) => ToolErrorKind::Timeout,
        }
    }

    /// Text the model sees: the bracketed marker followed by the message.
    pub fn render(&self) -> String {
        format!("{} {self}", self.kind().marker())
    }
}

/// Result of dispatching one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    pub call_id: String,
    pub tool_name: String,
    pub result: Result<String, ToolFailure>,
    pub elapsed: Duration,
}

impl ToolOutcome {
    pub fn is_error(&self) -> bool {
        self.result.is_err()
    }

    /// Output text as it will be stored in history.
    pub fn output(&self) -> String {
        match &self.result {
            Ok(out) => out.clone(),
            Err(failure) => failure.render(),
        }
    }

    pub fn into_turn_content(self) -> TurnContent {
        let (output, error) = match self.result {
            Ok(out) => (out, None),
            Err(failure) => (failure.render(), Some(failure.kind())),
        };
        TurnContent::ToolResult {
            call_id: self.call_id,
            tool_name: self.tool_name,
            output,
            error,
        }
    }
}

/// Executes tool calls against a shared [`ToolRegistry`].
#[derive(Debug, Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    max_result_bytes: usize,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            timeout: DEFAULT_TOOL_TIMEOUT,
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
        }
    }

    /// Default per-call timeout. A tool's own [`timeout`](super::Tool::timeout)
    /// takes precedence.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the maximum result size in bytes before truncation.
    pub fn with_max_result_bytes(mut self, max: usize) -> Self {
        self.max_result_bytes = max;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Execute one call. Never fails; every failure is in the outcome.
    pub async fn dispatch(&self, call: &ToolCall) -> ToolOutcome {
        self.dispatch_before(call, None).await
    }

    /// Like [`dispatch`](Self::dispatch), but the call's timeout is clamped so
    /// it cannot run past `deadline`.
    pub async fn dispatch_before(
        &self,
        call: &ToolCall,
        deadline: Option<Deadline>,
    ) -> ToolOutcome {
        let start = Instant::now();
        let result = self.run(call, deadline).await;
        let elapsed = start.elapsed();

        match &result {
            Ok(out) => {
                debug!(
                    "[tool] {} completed in {:.0}ms ({} bytes)",
                    call.name(),
                    elapsed.as_secs_f64() * 1000.0,
                    out.len()
                );
                let preview: String = out.chars().take(300).collect();
                trace!("[tool] {} result preview: {preview}", call.name());
            }
            Err(failure) => info!("[tool] {} failed: {}", call.name(), failure.render()),
        }

        ToolOutcome {
            call_id: call.id.clone(),
            tool_name: call.name().to_string(),
            result,
            elapsed,
        }
    }

    /// Execute a batch. Outcomes are returned in request order whether the
    /// calls ran concurrently or one after another.
    pub async fn dispatch_all(&self, calls: &[ToolCall], concurrent: bool) -> Vec<ToolOutcome> {
        self.dispatch_all_before(calls, concurrent, None).await
    }

    /// Execute a batch with every call bounded by `deadline`. A call still
    /// running when the deadline passes ends as a [`ToolFailure::Timeout`].
    pub async fn dispatch_all_before(
        &self,
        calls: &[ToolCall],
        concurrent: bool,
        deadline: Option<Deadline>,
    ) -> Vec<ToolOutcome> {
        if concurrent && calls.len() > 1 {
            join_all(calls.iter().map(|call| self.dispatch_before(call, deadline))).await
        } else {
            let mut outcomes = Vec::with_capacity(calls.len());
            for call in calls {
                outcomes.push(self.dispatch_before(call, deadline).await);
            }
            outcomes
        }
    }

    async fn run(
        &self,
        call: &ToolCall,
        deadline: Option<Deadline>,
    ) -> Result<String, ToolFailure> {
        let name = call.name();
        let Some(tool) = self.registry.get(name) else {
            return Err(ToolFailure::UnknownTool(name.to_string()));
        };

        let input: serde_json::Value = serde_json::from_str(call.arguments()).map_err(|e| {
            ToolFailure::InvalidInput(format!("arguments are not valid JSON: {e}"))
        })?;
        let violations = self.registry.validate(name, &input);
        if !violations.is_empty() {
            return Err(ToolFailure::InvalidInput(format!(
                "input does not match the schema of '{name}':\n  - {}",
                violations.join("\n  - ")
            )));
        }

        log_tool_call(name, call.arguments());
        let mut timeout = tool.timeout().unwrap_or(self.timeout);
        if let Some(deadline) = deadline {
            timeout = timeout.min(deadline.saturating_duration_since(Deadline::now()));
        }
        // The async block defers `execute` into the first poll so a panic
        // while building the future is caught too.
        let guarded = AssertUnwindSafe(async move { tool.execute(input).await }).catch_unwind();

        match tokio::time::timeout(timeout, guarded).await {
            Err(_) => {
                info!(
                    "[tool] {name} timed out (limit: {:.0}s)",
                    timeout.as_secs_f64()
                );
                Err(ToolFailure::Timeout(timeout))
            }
            Ok(Err(panic)) => {
                let msg = panic_message(panic.as_ref());
                warn!("[tool] {name} panicked: {msg}");
                Err(ToolFailure::ExecutionFailed(format!("tool panicked: {msg}")))
            }
            Ok(Ok(Err(e))) => Err(ToolFailure::ExecutionFailed(e)),
            Ok(Ok(Ok(out))) => Ok(truncate_result(out, self.max_result_bytes)),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
