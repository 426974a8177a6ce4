//! Agent runtime for driving a language-model endpoint through a bounded
//! observe → think → act loop.
//!
//! `tether-rs` runs the tool-use loop around a model endpoint and manages
//! the conversation state that loop produces: an append-only turn history,
//! a per-call context window that fits the model's token budget, explicit
//! prompt-cache handles for stable prefixes, and a tool dispatcher that
//! turns every model-requested call into exactly one result turn.
//!
//! # Getting started
//!
//! ```ignore
//! use std::num::NonZeroU32;
//! use std::sync::Arc;
//! use tether_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let api_key = std::env::var("OPENROUTER_KEY")?;
//!     let endpoint = Arc::new(OpenRouterClient::new(api_key)?);
//!
//!     let tools = Arc::new(ToolRegistry::new().with(FnTool::new(
//!         ToolDef::new("lookup", "Look up a term", json_schema_for::<LookupArgs>()),
//!         |args: LookupArgs| async move { Ok(format!("definition of {}", args.term)) },
//!     ))?);
//!
//!     let config = RuntimeConfig::new("anthropic/claude-sonnet-4", NonZeroU32::new(10).unwrap())
//!         .with_max_output_tokens(2048);
//!
//!     let runtime = AgentRuntime::new(endpoint, config).with_event_handler(Arc::new(LoggingHandler));
//!     let session = runtime.start_session("You are a concise research assistant.", tools).await?;
//!
//!     let outcome = runtime.run(&session, "What does 'idempotent' mean?").await?;
//!     println!("{}", outcome.answer);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`history`] | [`Turn`](history::Turn) records and the append-only [`HistoryStore`](history::HistoryStore) |
//! | [`context`] | Token budget, atomic turn units, truncation, sliding window, summarization, [`ContextSnapshot`](context::ContextSnapshot) |
//! | [`cache`] | Explicit prompt-cache handles, prefix fingerprints, the [`CacheCoordinator`](cache::CacheCoordinator) |
//! | [`tools`] | [`Tool`](tools::Tool) trait, [`ToolRegistry`](tools::ToolRegistry), [`ToolDispatcher`](tools::ToolDispatcher) |
//! | [`api`] | [`ModelEndpoint`](api::ModelEndpoint) trait, OpenRouter client, scripted endpoint, retry, cost tracking |
//! | [`agent`] | [`AgentRuntime`](agent::AgentRuntime) caller API, loop state machine, configuration, events, prompt chains |
//! | [`memory`] | Optional external key-value memory |
//! | [`error`] | [`RuntimeError`](error::RuntimeError) and component errors |
//!
//! # Design principles
//!
//! 1. **Every loop is bounded.** An iteration ceiling is a required
//!    configuration value, sessions carry a wall-clock budget, and every model
//!    and tool call has its own timeout.
//!
//! 2. **Tool failures belong to the model.** Unknown tools, invalid input,
//!    tool errors and timeouts come back as result turns the model can react
//!    to. Only repeated identical failures abort the session.
//!
//! 3. **History is never rewritten.** Truncation and summarization shape the
//!    snapshot sent outward; the store keeps every turn for audit and
//!    resumption.
//!
//! 4. **Caching changes cost, not answers.** The cache coordinator can fail or
//!    be disabled with no effect on what the model sees.

pub mod agent;
pub mod api;
pub mod cache;
pub mod context;
pub mod error;
pub mod history;
pub mod logging;
pub mod memory;
pub mod prelude;
pub mod tools;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// Re-export schemars for downstream crates.
pub use schemars;

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`. This is the bridge between strong Rust types
/// and the schema a [`Tool`](tools::Tool) advertises to the model.
///
/// # Example
///
/// ```
/// use tether_rs::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct LookupArgs {
///     term: String,
///     #[serde(default)]
///     language: Option<String>,
/// }
///
/// let schema = json_schema_for::<LookupArgs>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"term".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a chat-completions message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// A chat-completions message, as sent over the wire.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_tool_calls(text: Option<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: text,
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }
}

// ── Tool types ─────────────────────────────────────────────────────

/// The type of a tool definition. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition advertised to the model (function-calling format).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    /// Create a function-calling tool definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }

    /// The tool's name.
    pub fn name(&self) -> &str {
        &self.function.name
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// The type of a tool call. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum CallType {
    #[serde(rename = "function")]
    Function,
}

/// A tool call requested by the model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub function: FunctionCallData,
}

impl ToolCall {
    /// Build a function call with raw JSON `arguments`.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: CallType::Function,
            function: FunctionCallData {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// Name of the requested tool.
    pub fn name(&self) -> &str {
        &self.function.name
    }

    /// Raw JSON arguments as produced by the model.
    pub fn arguments(&self) -> &str {
        &self.function.arguments
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FunctionCallData {
    pub name: String,
    pub arguments: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors() {
        let sys = Message::system("hello");
        assert_eq!(sys.role, MessageRole::System);
        assert_eq!(sys.content.as_deref(), Some("hello"));

        let user = Message::user("world");
        assert_eq!(user.role, MessageRole::User);

        let calls = Message::assistant_tool_calls(None, vec![ToolCall::new("c1", "lookup", "{}")]);
        assert_eq!(calls.role, MessageRole::Assistant);
        assert!(calls.content.is_none());
        assert_eq!(calls.tool_calls.as_ref().map(|c| c.len()), Some(1));

        let tool = Message::tool_result("call-1", "result");
        assert_eq!(tool.role, MessageRole::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("call-1"));
    }

    #[test]
    fn tool_call_serializes_in_function_format() {
        let call = ToolCall::new("c1", "lookup", r#"{"term":"x"}"#);
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["type"], "function");
        assert_eq!(json["function"]["name"], "lookup");
        assert_eq!(call.name(), "lookup");
        assert_eq!(call.arguments(), r#"{"term":"x"}"#);
    }

    #[test]
    fn message_skips_empty_fields() {
        let json = serde_json::to_value(Message::user("hi")).unwrap();
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("tool_call_id").is_none());
    }
}
