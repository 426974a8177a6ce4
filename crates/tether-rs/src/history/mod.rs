//! Conversation history: immutable [`Turn`] records in an append-only
//! [`HistoryStore`].
//!
//! The store is the leaf of the runtime. It enforces the two ordering rules
//! every other component relies on: sequence numbers are gapless and strictly
//! increasing, and a tool-result turn directly follows the assistant turn
//! that requested it.

pub mod store;
pub mod turn;

pub use store::HistoryStore;
pub use turn::{Role, ToolErrorKind, Turn, TurnContent};
