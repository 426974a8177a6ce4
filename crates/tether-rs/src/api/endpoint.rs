//! The model endpoint seam.
//!
//! The loop controller only ever talks to a [`ModelEndpoint`]: one request
//! in, one response (or [`ModelError`]) out. What the model decided is
//! carried by the discrete [`StopSignal`], which is what drives the loop's
//! state machine.

use std::future::Future;
use std::pin::Pin;

use crate::context::{ContextItem, ItemOrigin};
use crate::error::ModelError;
use crate::history::{Role, TurnContent};
use crate::{Message, ToolCall, ToolDef};

/// Boxed future returned by [`ModelEndpoint::complete`].
pub type ModelFuture<'a> = Pin<Box<dyn Future<Output = Result<ModelResponse, ModelError>> + Send + 'a>>;

/// One model call.
///
/// When `cache_ref` is set, the referenced remote cache already holds the
/// pinned instruction (and possibly a leading run of items); `pinned_instruction`
/// is then `None` if it is covered and `items` holds only the fresh suffix.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub model: String,
    pub pinned_instruction: Option<String>,
    pub items: Vec<ContextItem>,
    pub cache_ref: Option<String>,
    pub tools: Vec<ToolDef>,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

impl ModelRequest {
    /// A tool-less single-turn request (used for summarization and prompt
    /// chains).
    pub fn single_turn(
        model: impl Into<String>,
        system: impl Into<String>,
        user: impl Into<String>,
        max_output_tokens: u32,
        temperature: f32,
    ) -> Self {
        let user = TurnContent::text(user);
        Self {
            model: model.into(),
            pinned_instruction: Some(system.into()),
            items: vec![ContextItem::new(Role::User, user, 0, ItemOrigin::Turn(0))],
            cache_ref: None,
            tools: Vec::new(),
            max_output_tokens,
            temperature,
        }
    }

    /// Wire messages for the fresh part of the request.
    pub fn messages(&self) -> Vec<Message> {
        self.pinned_instruction
            .iter()
            .map(|text| Message::system(text.clone()))
            .chain(self.items.iter().map(ContextItem::to_message))
            .collect()
    }

    /// Estimated fresh input tokens.
    pub fn fresh_tokens(&self) -> usize {
        self.items.iter().map(|i| i.tokens).sum()
    }
}

/// Why the model stopped producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Final answer.
    Completed,
    /// The model asked for tool calls.
    ToolRequested,
    /// Output hit the token limit.
    LengthLimited,
}

/// Token usage reported by the endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub fresh_input_tokens: u32,
    pub cached_input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn input_tokens(&self) -> u32 {
        self.fresh_input_tokens + self.cached_input_tokens
    }

    pub fn add(&mut self, other: &Usage) {
        self.fresh_input_tokens += other.fresh_input_tokens;
        self.cached_input_tokens += other.cached_input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// One model response.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub stop: StopSignal,
    pub usage: Usage,
}

impl ModelResponse {
    /// A final text answer.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
            stop: StopSignal::Completed,
            usage: Usage::default(),
        }
    }

    /// A tool-call request.
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            text: None,
            tool_calls: calls,
            stop: StopSignal::ToolRequested,
            usage: Usage::default(),
        }
    }

    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }
}

/// A language-model endpoint.
///
/// Implementations must be safe to call concurrently from many sessions.
pub trait ModelEndpoint: Send + Sync {
    fn complete<'a>(&'a self, request: &'a ModelRequest) -> ModelFuture<'a>;
}
