//! Per-session state owned by the loop controller.
//!
//! Session state is never shared between sessions: its history, summarizer,
//! cache slot and counters belong to one conversation. Callers hold a
//! [`SessionHandle`], which is cheap to clone and safe to pass to another
//! task (for example to cancel from a signal handler).

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::state::LoopState;
use crate::ToolDef;
use crate::api::Usage;
use crate::api::tracing::CostTracker;
use crate::cache::CacheSlot;
use crate::context::Summarizer;
use crate::error::RuntimeError;
use crate::history::{HistoryStore, Turn};
use crate::tools::{FailureTracker, ToolDispatcher};

/// Everything one conversation owns.
pub(crate) struct Session {
    pub(crate) id: String,
    /// Instruction plus memory documents. Never reduced.
    pub(crate) pinned: String,
    pub(crate) history: HistoryStore,
    pub(crate) summarizer: Option<Summarizer>,
    pub(crate) cache_slot: CacheSlot,
    pub(crate) state: LoopState,
    pub(crate) dispatcher: ToolDispatcher,
    pub(crate) tool_defs: Vec<ToolDef>,
    pub(crate) failures: FailureTracker,
    pub(crate) cost: CostTracker,
    pub(crate) usage: Usage,
    /// Model calls across all runs.
    pub(crate) iterations: u32,
    pub(crate) runs: u32,
    pub(crate) last_error: Option<RuntimeError>,
    /// Set by `end_session`; no further runs are accepted.
    pub(crate) closed: bool,
    pub(crate) renewal: Option<Renewal>,
}

/// Background cache renewal task and the token that stops it.
pub(crate) struct Renewal {
    pub(crate) token: CancellationToken,
    pub(crate) task: JoinHandle<()>,
}

impl Renewal {
    pub(crate) async fn stop(self) {
        self.token.cancel();
        let _ = self.task.await;
    }
}

impl Session {
    /// Move to `next`. An illegal transition is a defect in the loop
    /// controller.
    pub(crate) fn transition(&mut self, next: LoopState) -> Result<LoopState, RuntimeError> {
        let from = self.state;
        if !from.can_transition_to(next) {
            return Err(RuntimeError::InvariantViolation(format!(
                "illegal state transition {from} → {next}"
            )));
        }
        self.state = next;
        Ok(from)
    }

    pub(crate) fn summary(&self) -> Option<&str> {
        self.summarizer.as_ref().and_then(Summarizer::summary)
    }

    /// First sequence number not covered by the running summary.
    pub(crate) fn boundary(&self) -> u64 {
        self.summarizer.as_ref().map_or(0, Summarizer::boundary)
    }
}

/// Caller-side reference to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    pub(crate) id: Arc<str>,
    pub(crate) cancel: CancellationToken,
    pub(crate) inner: Arc<Mutex<Session>>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Copy of every stored turn, oldest first. Waits for a running
    /// iteration to reach a boundary.
    pub async fn history(&self) -> Vec<Turn> {
        self.inner.lock().await.history.turns().to_vec()
    }

    pub async fn state(&self) -> LoopState {
        self.inner.lock().await.state
    }

    /// Token usage summed over every model call in this session.
    pub async fn usage(&self) -> Usage {
        self.inner.lock().await.usage
    }

    pub async fn cost(&self) -> CostTracker {
        self.inner.lock().await.cost.clone()
    }

    pub async fn summary(&self) -> Option<String> {
        self.inner.lock().await.summary().map(str::to_string)
    }

    /// Id of the prompt-cache handle currently attached, if any.
    pub async fn cache_id(&self) -> Option<String> {
        self.inner.lock().await.cache_slot.current_id()
    }
}

/// Result of one successful [`run`](super::AgentRuntime::run).
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub answer: String,
    /// Model calls this run made.
    pub iterations: u32,
    /// The model stopped at the output-size cap instead of finishing.
    pub length_limited: bool,
    /// Token usage for this run only.
    pub usage: Usage,
}

/// Final accounting returned by [`end_session`](super::AgentRuntime::end_session).
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: String,
    pub state: LoopState,
    pub runs: u32,
    pub iterations: u32,
    pub usage: Usage,
    pub cost: CostTracker,
    pub summary: Option<String>,
    /// First sequence number the summary does not cover.
    pub summary_boundary: u64,
    /// Error that closed the session, if it was aborted.
    pub error: Option<RuntimeError>,
    /// Whether the summary or last answer was written to memory.
    pub memory_saved: bool,
    /// The full turn history, for audit or a later `resume_session`.
    pub history: Vec<Turn>,
}

/// What [`resume_session`](super::AgentRuntime::resume_session) rebuilds a
/// session from: the archived turns and, if the session had been
/// summarized, the running summary and the boundary it covers.
#[derive(Debug, Clone, Default)]
pub struct SessionArchive {
    pub turns: Vec<Turn>,
    pub summary: Option<String>,
    pub summary_boundary: u64,
}

impl SessionArchive {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self {
            turns,
            ..Default::default()
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>, boundary: u64) -> Self {
        self.summary = Some(summary.into());
        self.summary_boundary = boundary;
        self
    }
}

impl From<Vec<Turn>> for SessionArchive {
    fn from(turns: Vec<Turn>) -> Self {
        Self::new(turns)
    }
}

impl From<SessionReport> for SessionArchive {
    fn from(report: SessionReport) -> Self {
        Self {
            turns: report.history,
            summary: report.summary,
            summary_boundary: report.summary_boundary,
        }
    }
}
