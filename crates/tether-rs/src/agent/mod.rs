//! Agent runtime: the [`AgentRuntime`] loop controller and its caller API.
//!
//! - [`runtime::AgentRuntime`] — `start_session`, `run`, `cancel`,
//!   `end_session`, `resume_session`. Start here.
//! - [`config::RuntimeConfig`] — model, iteration ceiling, timeouts, context
//!   budget, and the optional summarization and caching modules.
//! - [`state::LoopState`] — the `Idle → Requesting → ToolPending → Done |
//!   Aborted` state machine.
//! - [`events`] — [`EventHandler`] trait and [`RuntimeEvent`] enum for
//!   observing sessions. Includes [`LoggingHandler`], [`CompositeEventHandler`],
//!   [`FnEventHandler`], and [`EventObserver`].
//! - [`session`] — [`SessionHandle`], [`RunOutcome`], [`SessionReport`],
//!   [`SessionArchive`].
//! - [`chain`] — [`PromptChain`] of gated single-call steps.

pub mod chain;
pub mod config;
pub mod events;
pub mod runtime;
pub mod session;
pub mod state;

pub use chain::{ChainError, ChainResult, ChainStep, Gate, PromptChain, json_gate, min_numbered_points};
pub use config::{ConfigFile, ContextConfig, MemoryConfig, RuntimeConfig, Toggle};
pub use events::{
    CompositeEventHandler, EventHandler, EventObserver, EventResponse, FnEventHandler,
    LoggingHandler, NoopHandler, RuntimeEvent,
};
pub use runtime::AgentRuntime;
pub use session::{RunOutcome, SessionArchive, SessionHandle, SessionReport};
pub use state::LoopState;
