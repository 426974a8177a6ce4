//! Repeated-failure detection for tool calls.
//!
//! A streak counts consecutive identical failures of the same tool with the
//! same input. A success clears it and a different error restarts it at one.
//! Reaching the threshold is the only way tool failures end a session.

use std::collections::HashMap;

use super::dispatch::ToolOutcome;

/// The threshold was reached for one (tool, input) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureStreak {
    pub tool: String,
    pub count: u32,
    pub error: String,
}

#[derive(Debug, Clone)]
struct Streak {
    error: String,
    count: u32,
}

/// Per-session failure streaks keyed by tool name and canonical input.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    threshold: u32,
    streaks: HashMap<(String, String), Streak>,
}

impl FailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            streaks: HashMap::new(),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Record an outcome for a call made with raw `arguments`. Returns the
    /// streak when it reaches the threshold.
    pub fn record(&mut self, outcome: &ToolOutcome, arguments: &str) -> Option<FailureStreak> {
        let key = (outcome.tool_name.clone(), canonical_input(arguments));
        let Err(failure) = &outcome.result else {
            self.streaks.remove(&key);
            return None;
        };

        let error = failure.render();
        let streak = self.streaks.entry(key).or_insert(Streak {
            error: error.clone(),
            count: 0,
        });
        if streak.error == error {
            streak.count += 1;
        } else {
            streak.error = error;
            streak.count = 1;
        }

        (streak.count >= self.threshold).then(|| FailureStreak {
            tool: outcome.tool_name.clone(),
            count: streak.count,
            error: streak.error.clone(),
        })
    }

    /// Current streak length for a (tool, arguments) pair.
    pub fn streak(&self, tool: &str, arguments: &str) -> u32 {
        self.streaks
            .get(&(tool.to_string(), canonical_input(arguments)))
            .map_or(0, |s| s.count)
    }
}

/// Key-order-insensitive form of JSON arguments. Unparseable input is kept
/// verbatim, trimmed.
fn canonical_input(arguments: &str) -> String {
    serde_json::from_str::<serde_json::Value>(arguments)
        .ok()
        .and_then(|v| serde_json::to_string(&v).ok())
        .unwrap_or_else(|| arguments.trim().to_string())
}
