//! Model endpoint layer: the endpoint trait, HTTP client, retry, and cost
//! tracking.
//!
//! These modules handle everything between the
//! [`AgentRuntime`](crate::agent::AgentRuntime) loop and a language model:
//!
//! - [`endpoint`] — the [`ModelEndpoint`] trait, [`ModelRequest`],
//!   [`ModelResponse`] and the discrete [`StopSignal`].
//! - [`openrouter`] — [`OpenRouterClient`], an OpenAI-compatible HTTP
//!   endpoint.
//! - [`scripted`] — [`ScriptedEndpoint`] for deterministic tests and replays.
//! - [`retry`] — bounded exponential backoff for transient failures. Never
//!   retries authentication, quota or malformed-request errors.
//! - [`tracing`] — session and span ids, per-model pricing tables, and the
//!   cumulative [`CostTracker`].

pub mod endpoint;
pub mod openrouter;
pub mod retry;
pub mod scripted;
pub mod tracing;

pub use endpoint::{ModelEndpoint, ModelFuture, ModelRequest, ModelResponse, StopSignal, Usage};
pub use openrouter::{DEFAULT_MODEL, OPENROUTER_URL, OpenRouterClient};
pub use retry::{RetryConfig, retry_model_call};
pub use scripted::ScriptedEndpoint;
pub use tracing::{
    CostTracker, ModelPricing, generate_session_id, generate_span_id, pricing_for_model,
};
