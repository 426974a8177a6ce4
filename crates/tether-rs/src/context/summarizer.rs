//! Anchored incremental summarization of aged turns.
//!
//! Keeps one running summary and a boundary sequence number. Turns before the
//! boundary are represented only by the summary; turns at or after it are
//! sent verbatim (subject to truncation). Each compaction merges the existing
//! summary with the newly aged span in a single subordinate model call, so
//! the whole history is never re-summarized.
//!
//! Summarization is lossy and compounding: detail dropped by an earlier pass
//! cannot be recovered by a later one. Callers that need durable facts should
//! write them to a [`MemoryStore`](crate::memory::MemoryStore).

use std::time::Duration;

use crate::history::{Turn, TurnContent};

use super::units::atomic_units;

const SUMMARIZATION_PROMPT: &str = "\
You compress conversation history for an assistant that will continue the conversation.

Summarize the messages you are given in a few short sentences, then list any facts \
the assistant must not lose:
- The user's goals and any constraints or preferences they stated
- Decisions made and answers already given
- Tool calls that were made and what they returned, including failures
- Names, identifiers, numbers, and error messages, verbatim

Rules:
- Only include facts explicitly stated in the messages. Do not infer or extrapolate.
- If there is an existing summary, merge the new information into it. The result must \
  be a single standalone summary that replaces the existing one entirely.";

/// Configuration for incremental summarization.
#[derive(Debug, Clone, PartialEq)]
pub struct SummarizerConfig {
    /// Model for the summarization call. `None` uses the session's model.
    pub model: Option<String>,
    /// Newest turns always kept verbatim.
    pub retain_recent_turns: usize,
    /// Summarize when more than this many turns follow the boundary.
    pub trigger_turns: usize,
    /// Output cap for the summarization call.
    pub max_summary_tokens: u32,
    /// Timeout for the summarization call.
    pub timeout: Duration,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            model: None,
            retain_recent_turns: 6,
            trigger_turns: 12,
            max_summary_tokens: 512,
            timeout: Duration::from_secs(60),
        }
    }
}

impl SummarizerConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_retain_recent_turns(mut self, turns: usize) -> Self {
        self.retain_recent_turns = turns;
        self
    }

    pub fn with_trigger_turns(mut self, turns: usize) -> Self {
        self.trigger_turns = turns;
        self
    }

    pub fn with_max_summary_tokens(mut self, tokens: u32) -> Self {
        self.max_summary_tokens = tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Span of history selected for the next compaction: `from <= seq < to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryPlan {
    pub from: u64,
    pub to: u64,
}

/// State for the incremental summarizer.
#[derive(Debug, Clone)]
pub struct Summarizer {
    summary: Option<String>,
    /// First sequence number not covered by the summary.
    boundary: u64,
    compactions: u32,
    config: SummarizerConfig,
}

impl Summarizer {
    pub fn new(config: SummarizerConfig) -> Self {
        Self {
            summary: None,
            boundary: 0,
            compactions: 0,
            config,
        }
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn boundary(&self) -> u64 {
        self.boundary
    }

    pub fn compactions(&self) -> u32 {
        self.compactions
    }

    pub fn config(&self) -> &SummarizerConfig {
        &self.config
    }

    /// Whether a compaction should run before the next composition.
    pub fn should_summarize(&self, unsummarized_turns: usize, over_ceiling: bool) -> bool {
        over_ceiling || unsummarized_turns > self.config.trigger_turns
    }

    /// Choose the span to summarize from the turns after the boundary.
    ///
    /// The span ends on a unit boundary, leaves at least
    /// `retain_recent_turns` turns verbatim and never includes the newest
    /// unit. Returns `None` when nothing can be summarized.
    pub fn plan(&self, unsummarized: &[Turn]) -> Option<SummaryPlan> {
        let first = unsummarized.first()?.sequence();
        let limit = unsummarized
            .len()
            .saturating_sub(self.config.retain_recent_turns);
        let units = atomic_units(unsummarized);
        let split = units
            .iter()
            .skip(1)
            .map(|u| u.start)
            .take_while(|&start| start <= limit)
            .last()?;
        Some(SummaryPlan {
            from: first,
            to: first + split as u64,
        })
    }

    /// Build the (system, user) pair for the summarization call.
    pub fn build_summarization_request(&self, span: &[Turn]) -> (String, String) {
        let mut content = String::new();

        if let Some(ref existing) = self.summary {
            content.push_str("=== EXISTING SUMMARY ===\n");
            content.push_str(existing);
            content.push_str("\n\n=== NEW MESSAGES TO SUMMARIZE ===\n");
        }

        for turn in span {
            content.push_str(&render_turn(turn));
            content.push_str("\n\n");
        }

        (SUMMARIZATION_PROMPT.to_string(), content)
    }

    /// Record a new summary and advance the boundary.
    pub fn apply_summary(&mut self, new_summary: String, new_boundary: u64) {
        self.summary = Some(new_summary);
        self.boundary = new_boundary;
        self.compactions += 1;
    }

    /// Restore archived state when resuming a session.
    pub fn restore(&mut self, summary: String, boundary: u64) {
        self.summary = Some(summary);
        self.boundary = boundary;
    }

    /// Model to use for summarization.
    pub fn summary_model<'a>(&'a self, main_model: &'a str) -> &'a str {
        self.config.model.as_deref().unwrap_or(main_model)
    }
}

fn render_turn(turn: &Turn) -> String {
    match (turn.role(), turn.content()) {
        (role, TurnContent::Text(text)) => format!("[{role}]: {text}"),
        (_, TurnContent::ToolRequest { text, calls }) => {
            let calls: Vec<String> = calls
                .iter()
                .map(|c| format!("{}({})", c.name(), c.arguments()))
                .collect();
            match text {
                Some(text) => format!("[assistant]: {text}\n[tool calls]: {}", calls.join(", ")),
                None => format!("[tool calls]: {}", calls.join(", ")),
            }
        }
        (_, TurnContent::ToolResult {
            tool_name, output, ..
        }) => format!("[{tool_name} result]: {output}"),
    }
}
