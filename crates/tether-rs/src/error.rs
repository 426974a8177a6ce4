//! Error types for the runtime.
//!
//! Component errors stay inside their module. [`RuntimeError`] is the only
//! type that crosses the caller boundary: every failed
//! [`AgentRuntime::run()`](crate::agent::AgentRuntime::run) resolves to
//! exactly one of its variants, and [`RuntimeError::code()`] gives a stable
//! string for each.
//!
//! Tool failures are deliberately absent here. They are fed back to the model
//! as tool-result turns (see [`ToolFailure`](crate::tools::ToolFailure)) and
//! only reach the caller indirectly, through
//! [`RuntimeError::ToolFailureThresholdExceeded`].

use std::time::Duration;

// ── Component errors ───────────────────────────────────────────────

/// A turn could not be appended without breaking history ordering.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("ordering violation at sequence {sequence}: {reason}")]
    OrderingViolation { sequence: u64, reason: String },
}

/// The context window could not be composed within the token ceiling.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// The pinned instruction alone does not fit. Configuration problem.
    #[error("pinned content needs {pinned} tokens but the ceiling is {ceiling}")]
    PinnedTooLarge { pinned: usize, ceiling: usize },
    /// Every enabled reduction policy ran and the snapshot is still too big.
    #[error("context needs {required} tokens after all reductions, ceiling is {ceiling}")]
    Overflow { required: usize, ceiling: usize },
}

/// Failure reported by a [`ModelEndpoint`](crate::api::ModelEndpoint).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("quota exhausted: {0}")]
    Quota(String),
    #[error("transient endpoint failure: {0}")]
    Transient(String),
    #[error("request rejected: {0}")]
    InvalidRequest(String),
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
    #[error("model endpoint error: {0}")]
    Other(String),
}

impl ModelError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ModelError::Transient(_) | ModelError::Timeout(_))
    }

    /// Classify an HTTP error status and body.
    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = format!("HTTP {status}: {body}");
        match status {
            401 | 403 => ModelError::Authentication(detail),
            402 => ModelError::Quota(detail),
            408 | 429 | 500..=599 => ModelError::Transient(detail),
            400..=499 => ModelError::InvalidRequest(detail),
            _ => ModelError::Other(detail),
        }
    }
}

/// Failure talking to a remote cache backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("prefix of {tokens} tokens is below the {minimum}-token minimum")]
    BelowMinimum { tokens: usize, minimum: usize },
    #[error("cache '{0}' not found")]
    NotFound(String),
    #[error("cache operation timed out after {0:?}")]
    Timeout(Duration),
}

/// A tool could not be registered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("tool '{name}' has an invalid input schema: {reason}")]
    InvalidSchema { name: String, reason: String },
    #[error("tool '{0}' is already registered")]
    DuplicateName(String),
}

/// Failure reading or writing the external memory store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("memory store error: {0}")]
    Store(String),
}

// ── Caller-facing error ────────────────────────────────────────────

/// The fixed set of ways a session run can end without an answer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    #[error("context overflow: need {required} tokens, ceiling is {ceiling}")]
    ContextOverflow { required: usize, ceiling: usize },
    #[error("iteration budget exhausted after {max} model calls")]
    IterationBudgetExceeded { max: u32 },
    #[error("session cancelled")]
    Cancelled,
    #[error("tool '{tool}' failed identically {count} times in a row: {error}")]
    ToolFailureThresholdExceeded {
        tool: String,
        count: u32,
        error: String,
    },
    #[error("session exceeded its {0:?} time budget")]
    SessionTimedOut(Duration),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("session {0} is closed")]
    SessionClosed(String),
    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),
}

impl RuntimeError {
    /// Stable machine-readable code for this outcome.
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeError::ContextOverflow { .. } => "CONTEXT_OVERFLOW",
            RuntimeError::IterationBudgetExceeded { .. } => "ITERATION_BUDGET_EXCEEDED",
            RuntimeError::Cancelled => "CANCELLED",
            RuntimeError::ToolFailureThresholdExceeded { .. } => "TOOL_FAILURE_THRESHOLD_EXCEEDED",
            RuntimeError::SessionTimedOut(_) => "SESSION_TIMED_OUT",
            RuntimeError::Model(_) => "MODEL_ERROR",
            RuntimeError::Configuration(_) => "CONFIGURATION",
            RuntimeError::SessionClosed(_) => "SESSION_CLOSED",
            RuntimeError::InvariantViolation(_) => "INVARIANT_VIOLATION",
        }
    }
}

impl From<ContextError> for RuntimeError {
    fn from(e: ContextError) -> Self {
        match e {
            ContextError::PinnedTooLarge { .. } => RuntimeError::Configuration(e.to_string()),
            ContextError::Overflow { required, ceiling } => {
                RuntimeError::ContextOverflow { required, ceiling }
            }
        }
    }
}

impl From<HistoryError> for RuntimeError {
    fn from(e: HistoryError) -> Self {
        RuntimeError::InvariantViolation(e.to_string())
    }
}
