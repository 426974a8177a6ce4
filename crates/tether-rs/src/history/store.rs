//! Append-only turn log with ordering checks.

use crate::error::HistoryError;

use super::turn::{Role, Turn, TurnContent};

/// Ordered, append-only log of a session's turns.
///
/// Sequence numbers start at 0 and are gapless, so a turn's sequence number
/// is also its index. Tool results must directly follow the tool request
/// that asked for them; while any call of the latest request is unanswered,
/// only its results may be appended.
///
/// Nothing is ever removed. Context reduction happens on the snapshot sent to
/// the model, never here.
#[derive(Debug, Default, Clone)]
pub struct HistoryStore {
    turns: Vec<Turn>,
    total_tokens: usize,
    /// Call ids of the latest tool request that have no result yet.
    outstanding: Vec<String>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number the next appended turn must carry.
    pub fn next_sequence(&self) -> u64 {
        self.turns.len() as u64
    }

    /// Append a turn, enforcing sequence and role ordering.
    pub fn append(&mut self, turn: Turn) -> Result<(), HistoryError> {
        let violation = |reason: String| HistoryError::OrderingViolation {
            sequence: turn.sequence(),
            reason,
        };

        if turn.sequence() != self.next_sequence() {
            return Err(violation(format!(
                "expected sequence {}",
                self.next_sequence()
            )));
        }
        if !turn.content().fits_role(turn.role()) {
            return Err(violation(format!(
                "content does not fit role '{}'",
                turn.role()
            )));
        }

        match turn.content() {
            TurnContent::ToolResult { call_id, .. } => {
                let Some(pos) = self.outstanding.iter().position(|id| id == call_id) else {
                    return Err(violation(format!(
                        "tool result '{call_id}' does not answer an outstanding call of the preceding request"
                    )));
                };
                self.outstanding.remove(pos);
            }
            _ if !self.outstanding.is_empty() => {
                return Err(violation(format!(
                    "{} tool call(s) still awaiting results: {}",
                    self.outstanding.len(),
                    self.outstanding.join(", ")
                )));
            }
            TurnContent::ToolRequest { calls, .. } => {
                if calls.is_empty() {
                    return Err(violation("tool request carries no calls".into()));
                }
                let mut ids: Vec<&str> = calls.iter().map(|c| c.id.as_str()).collect();
                ids.sort_unstable();
                ids.dedup();
                if ids.len() != calls.len() {
                    return Err(violation("tool request repeats a call id".into()));
                }
                self.outstanding = calls.iter().map(|c| c.id.clone()).collect();
            }
            TurnContent::Text(_) => {}
        }

        self.total_tokens += turn.token_count();
        self.turns.push(turn);
        Ok(())
    }

    /// Turns with `from <= sequence < to`, clamped to what exists.
    pub fn slice(&self, from: u64, to: u64) -> &[Turn] {
        let len = self.turns.len();
        let start = usize::try_from(from).unwrap_or(len).min(len);
        let end = usize::try_from(to).unwrap_or(len).min(len).max(start);
        &self.turns[start..end]
    }

    /// All turns in order.
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Sum of stored token counts. O(1).
    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Call ids of the latest tool request still waiting for results.
    pub fn outstanding_calls(&self) -> &[String] {
        &self.outstanding
    }

    /// Text of the most recent assistant text turn, if any.
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.turns.iter().rev().find_map(|t| match t.content() {
            TurnContent::Text(text) if t.role() == Role::Assistant => Some(text.as_str()),
            _ => None,
        })
    }
}
