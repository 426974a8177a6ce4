//! Atomic turn units: the smallest spans reductions may drop.
//!
//! A user turn and the assistant turn that answers it travel together, and an
//! assistant tool request always travels with all of its results. Dropping or
//! summarizing whole units is what keeps a snapshot free of orphaned tool
//! requests or results.

use crate::history::{Role, Turn};

/// A contiguous span of turns `[start, end)` that is kept or dropped as one.
///
/// Indices are positions in the slice the unit was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unit {
    pub start: usize,
    pub end: usize,
    /// Sum of the stored token counts of the unit's turns.
    pub tokens: usize,
}

impl Unit {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Split `turns` into atomic units, oldest first.
pub fn atomic_units(turns: &[Turn]) -> Vec<Unit> {
    let mut units = Vec::new();
    let mut i = 0;

    while i < turns.len() {
        let start = i;
        match turns[i].role() {
            Role::User => {
                i += 1;
                if i < turns.len() && turns[i].role() == Role::Assistant {
                    i = consume_assistant(turns, i);
                }
            }
            Role::Assistant => i = consume_assistant(turns, i),
            // A result with no request in view. Only reachable when a slice
            // starts mid-unit; keep the stray results together.
            Role::ToolResult => i = skip_results(turns, i),
        }
        let tokens = turns[start..i].iter().map(Turn::token_count).sum();
        units.push(Unit {
            start,
            end: i,
            tokens,
        });
    }

    units
}

/// Consume the assistant turn at `i` and, if it requested tools, its results.
fn consume_assistant(turns: &[Turn], i: usize) -> usize {
    if turns[i].is_tool_request() {
        skip_results(turns, i + 1)
    } else {
        i + 1
    }
}

fn skip_results(turns: &[Turn], mut i: usize) -> usize {
    while i < turns.len() && turns[i].role() == Role::ToolResult {
        i += 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;
    use crate::history::TurnContent;

    fn user(seq: u64) -> Turn {
        Turn::new(seq, Role::User, TurnContent::text("q"), 10)
    }

    fn answer(seq: u64) -> Turn {
        Turn::new(seq, Role::Assistant, TurnContent::text("a"), 20)
    }

    fn request(seq: u64, ids: &[&str]) -> Turn {
        Turn::new(
            seq,
            Role::Assistant,
            TurnContent::ToolRequest {
                text: None,
                calls: ids.iter().map(|id| ToolCall::new(*id, "t", "{}")).collect(),
            },
            5,
        )
    }

    fn result(seq: u64, id: &str) -> Turn {
        Turn::new(
            seq,
            Role::ToolResult,
            TurnContent::ToolResult {
                call_id: id.into(),
                tool_name: "t".into(),
                output: "r".into(),
                error: None,
            },
            7,
        )
    }

    #[test]
    fn user_and_answer_pair() {
        let turns = vec![user(0), answer(1), user(2), answer(3)];
        let units = atomic_units(&turns);
        assert_eq!(units.len(), 2);
        assert_eq!((units[0].start, units[0].end, units[0].tokens), (0, 2, 30));
        assert_eq!((units[1].start, units[1].end), (2, 4));
    }

    #[test]
    fn tool_request_keeps_its_results() {
        let turns = vec![
            user(0),
            request(1, &["a", "b"]),
            result(2, "a"),
            result(3, "b"),
            request(4, &["c"]),
            result(5, "c"),
            answer(6),
        ];
        let units = atomic_units(&turns);
        let spans: Vec<_> = units.iter().map(|u| (u.start, u.end)).collect();
        assert_eq!(spans, vec![(0, 4), (4, 6), (6, 7)]);
        assert_eq!(units[0].tokens, 10 + 5 + 7 + 7);
    }

    #[test]
    fn consecutive_user_turns_stand_alone() {
        let turns = vec![user(0), user(1), answer(2)];
        let spans: Vec<_> = atomic_units(&turns)
            .iter()
            .map(|u| (u.start, u.end))
            .collect();
        assert_eq!(spans, vec![(0, 1), (1, 3)]);
    }

    #[test]
    fn units_cover_every_turn_once() {
        let turns = vec![
            result(0, "x"),
            user(1),
            request(2, &["a"]),
            result(3, "a"),
            answer(4),
            user(5),
        ];
        let units = atomic_units(&turns);
        let covered: usize = units.iter().map(Unit::len).sum();
        assert_eq!(covered, turns.len());
        for pair in units.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn empty_input() {
        assert!(atomic_units(&[]).is_empty());
    }
}
