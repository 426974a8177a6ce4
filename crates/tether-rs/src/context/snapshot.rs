//! The exact content sent to the model endpoint for one call.

use sha2::{Digest, Sha256};

use crate::Message;
use crate::history::{Role, Turn, TurnContent};

use super::budget::{Capacity, ContextUsage};

/// Tag wrapping the running summary when it is injected as a user item.
pub const SUMMARY_OPEN_TAG: &str = "<context_summary>";
pub const SUMMARY_CLOSE_TAG: &str = "</context_summary>";

/// Assistant acknowledgement that follows the injected summary.
pub const SUMMARY_ACK: &str = "Understood. I will continue from this summary.";

/// SHA-256 of a role tag and canonical content bytes, hex encoded.
pub fn fingerprint(role: &str, bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(role.as_bytes());
    hasher.update([0u8]);
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Where a snapshot item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOrigin {
    /// A history turn, by sequence number.
    Turn(u64),
    /// The injected summary or its acknowledgement.
    Summary,
}

/// The pinned instruction sent ahead of every call, never reduced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedInstruction {
    pub text: String,
    pub tokens: usize,
    pub fingerprint: String,
}

impl PinnedInstruction {
    pub fn new(text: impl Into<String>, tokens: usize) -> Self {
        let text = text.into();
        let fingerprint = fingerprint("system", text.as_bytes());
        Self {
            text,
            tokens,
            fingerprint,
        }
    }
}

/// One conversation item of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextItem {
    pub role: Role,
    pub content: TurnContent,
    pub tokens: usize,
    pub fingerprint: String,
    pub origin: ItemOrigin,
    /// Content was cut to fit the budget.
    pub truncated: bool,
}

impl ContextItem {
    pub fn new(role: Role, content: TurnContent, tokens: usize, origin: ItemOrigin) -> Self {
        let fingerprint = fingerprint(&role.to_string(), &content.canonical_bytes());
        Self {
            role,
            content,
            tokens,
            fingerprint,
            origin,
            truncated: false,
        }
    }

    /// Item for a history turn, using the turn's stored token count.
    pub fn from_turn(turn: &Turn) -> Self {
        Self::new(
            turn.role(),
            turn.content().clone(),
            turn.token_count(),
            ItemOrigin::Turn(turn.sequence()),
        )
    }

    /// Replace the content after truncation and refresh the fingerprint.
    pub(crate) fn replace_content(&mut self, content: TurnContent, tokens: usize) {
        self.fingerprint = fingerprint(&self.role.to_string(), &content.canonical_bytes());
        self.content = content;
        self.tokens = tokens;
        self.truncated = true;
    }

    /// Wire message for this item.
    pub fn to_message(&self) -> Message {
        match (&self.role, &self.content) {
            (Role::Assistant, TurnContent::Text(text)) => Message::assistant_text(text.clone()),
            (_, TurnContent::Text(text)) => Message::user(text.clone()),
            (_, TurnContent::ToolRequest { text, calls }) => {
                Message::assistant_tool_calls(text.clone(), calls.clone())
            }
            (_, TurnContent::ToolResult {
                call_id, output, ..
            }) => Message::tool_result(call_id.clone(), output.clone()),
        }
    }
}

/// The composed input for one model call.
///
/// `items[..pinned_items]` are summary items that are never dropped;
/// `items[newest_unit_start..]` is the newest atomic unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextSnapshot {
    pub pinned_instruction: PinnedInstruction,
    pub items: Vec<ContextItem>,
    pub pinned_items: usize,
    pub newest_unit_start: usize,
    pub total_tokens: usize,
    pub usage: ContextUsage,
    /// Atomic units left out by the sliding window or reactive truncation.
    pub dropped_units: usize,
    /// Turns whose content was cut to fit.
    pub truncated_turns: usize,
}

impl ContextSnapshot {
    pub fn capacity(&self) -> Capacity {
        self.usage.capacity()
    }

    pub fn ceiling(&self) -> usize {
        self.usage.ceiling
    }

    /// Whether any reduction shaped this snapshot.
    pub fn was_reduced(&self) -> bool {
        self.dropped_units > 0 || self.truncated_turns > 0
    }

    /// Wire messages: the pinned instruction followed by every item.
    pub fn messages(&self) -> Vec<Message> {
        std::iter::once(Message::system(self.pinned_instruction.text.clone()))
            .chain(self.items.iter().map(ContextItem::to_message))
            .collect()
    }

    /// Sequence numbers of the history turns included, in order.
    pub fn turn_sequences(&self) -> Vec<u64> {
        self.items
            .iter()
            .filter_map(|item| match item.origin {
                ItemOrigin::Turn(seq) => Some(seq),
                ItemOrigin::Summary => None,
            })
            .collect()
    }
}
