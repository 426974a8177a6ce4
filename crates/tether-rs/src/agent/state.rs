//! The loop controller's state machine.

use std::fmt;

/// Where a session's loop is.
///
/// `Idle → Requesting → {ToolPending → Requesting}* → Done | Aborted`.
/// `Done` returns to `Idle` when the caller starts the next run; `Aborted`
/// is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopState {
    Idle,
    Requesting,
    ToolPending,
    Done,
    Aborted,
}

impl LoopState {
    pub fn can_transition_to(self, next: LoopState) -> bool {
        use LoopState::*;
        matches!(
            (self, next),
            (Idle, Requesting)
                | (Idle, Aborted)
                | (Requesting, ToolPending)
                | (Requesting, Done)
                | (Requesting, Aborted)
                | (ToolPending, Requesting)
                | (ToolPending, Aborted)
                | (Done, Idle)
        )
    }

    /// No further model calls will be issued from this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::Done | LoopState::Aborted)
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Idle => "idle",
            LoopState::Requesting => "requesting",
            LoopState::ToolPending => "tool_pending",
            LoopState::Done => "done",
            LoopState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}
