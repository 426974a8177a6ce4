//! Turn records: the unit of conversation stored in a [`HistoryStore`](super::HistoryStore).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ToolCall;

/// Who produced a turn.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolResult,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::ToolResult => write!(f, "tool_result"),
        }
    }
}

/// Why a tool call produced an error result instead of output.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    UnknownTool,
    InvalidToolInput,
    ExecutionFailed,
    Timeout,
}

impl ToolErrorKind {
    /// Bracketed marker placed at the start of an error result's output.
    pub fn marker(&self) -> &'static str {
        match self {
            ToolErrorKind::UnknownTool => "[UnknownTool]",
            ToolErrorKind::InvalidToolInput => "[InvalidToolInput]",
            ToolErrorKind::ExecutionFailed => "[ToolExecutionFailed]",
            ToolErrorKind::Timeout => "[ToolTimeout]",
        }
    }
}

/// Payload of a turn.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnContent {
    /// Plain text from the user or the model.
    Text(String),
    /// The model asked for one or more tool calls, optionally with text.
    ToolRequest {
        text: Option<String>,
        calls: Vec<ToolCall>,
    },
    /// Outcome of one tool call.
    ToolResult {
        call_id: String,
        tool_name: String,
        output: String,
        error: Option<ToolErrorKind>,
    },
}

impl TurnContent {
    pub fn text(text: impl Into<String>) -> Self {
        TurnContent::Text(text.into())
    }

    /// Number of characters the model will read for this content. Used for
    /// token estimation.
    pub fn char_len(&self) -> usize {
        match self {
            TurnContent::Text(text) => text.chars().count(),
            TurnContent::ToolRequest { text, calls } => {
                text.as_deref().map_or(0, |t| t.chars().count())
                    + calls
                        .iter()
                        .map(|c| c.name().chars().count() + c.arguments().chars().count())
                        .sum::<usize>()
            }
            TurnContent::ToolResult {
                tool_name, output, ..
            } => tool_name.chars().count() + output.chars().count(),
        }
    }

    /// Canonical byte encoding, stable across runs. Used for prefix hashing.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // Serializing plain enums/strings into a Vec cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Whether this content may be stored under `role`.
    pub fn fits_role(&self, role: Role) -> bool {
        match self {
            TurnContent::Text(_) => matches!(role, Role::User | Role::Assistant),
            TurnContent::ToolRequest { .. } => role == Role::Assistant,
            TurnContent::ToolResult { .. } => role == Role::ToolResult,
        }
    }

    /// Whether this is a tool result carrying an error marker.
    pub fn is_error(&self) -> bool {
        matches!(self, TurnContent::ToolResult { error: Some(_), .. })
    }
}

/// An immutable conversation record.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Turn {
    sequence: u64,
    role: Role,
    content: TurnContent,
    token_count: usize,
    created_at: DateTime<Utc>,
}

impl Turn {
    /// Create a turn stamped with the current time.
    pub fn new(sequence: u64, role: Role, content: TurnContent, token_count: usize) -> Self {
        Self {
            sequence,
            role,
            content,
            token_count,
            created_at: Utc::now(),
        }
    }

    /// Replace the creation timestamp (used when rebuilding archived history).
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &TurnContent {
        &self.content
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Tool calls requested by this turn (empty unless it is a tool request).
    pub fn tool_calls(&self) -> &[ToolCall] {
        match &self.content {
            TurnContent::ToolRequest { calls, .. } => calls,
            _ => &[],
        }
    }

    pub fn is_tool_request(&self) -> bool {
        matches!(self.content, TurnContent::ToolRequest { .. })
    }

    /// Whether two turns record the same event, ignoring timestamps.
    pub fn same_record(&self, other: &Turn) -> bool {
        self.sequence == other.sequence
            && self.role == other.role
            && self.content == other.content
            && self.token_count == other.token_count
    }
}
