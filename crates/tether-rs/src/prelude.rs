//! Convenience re-exports for common `tether-rs` types.
//!
//! Meant to be glob-imported when embedding the runtime:
//!
//! ```ignore
//! use tether_rs::prelude::*;
//! ```
//!
//! This pulls in the types needed for most programs: the [`AgentRuntime`]
//! and its config, session handles, the [`Tool`] trait and registry, the
//! endpoint trait with its OpenRouter and scripted implementations, event
//! handlers, and the error type. Component internals (snapshot items, cache
//! fingerprints, retry policy) are left out; import those from their
//! modules directly when needed.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{Message, ToolCall, ToolDef, json_schema_for};

// ── Agent runtime ───────────────────────────────────────────────────
pub use crate::agent::{
    AgentRuntime, CompositeEventHandler, ConfigFile, EventHandler, EventObserver, EventResponse,
    FnEventHandler, LoggingHandler, LoopState, MemoryConfig, NoopHandler, PromptChain, RunOutcome,
    RuntimeConfig, RuntimeEvent, SessionArchive, SessionHandle, SessionReport, Toggle,
};

// ── Endpoints ───────────────────────────────────────────────────────
pub use crate::api::{
    ModelEndpoint, ModelRequest, ModelResponse, OpenRouterClient, ScriptedEndpoint, StopSignal,
    Usage,
};

// ── Context, cache, memory ──────────────────────────────────────────
pub use crate::cache::{CacheBackend, CacheConfig, InMemoryCacheBackend};
pub use crate::context::{SlidingWindow, SummarizerConfig};
pub use crate::memory::{FileMemoryStore, InMemoryStore, MemoryStore};

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::tools::{FnTool, Tool, ToolFuture, ToolRegistry};

// ── Errors ──────────────────────────────────────────────────────────
pub use crate::error::{ModelError, RuntimeError};
