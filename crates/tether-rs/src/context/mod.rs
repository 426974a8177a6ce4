//! Context window management: budgets, atomic units, truncation, and
//! summarization.
//!
//! Every model call receives a [`ContextSnapshot`] composed fresh from the
//! history store. The snapshot is the only thing reductions touch; stored
//! turns are never rewritten.
//!
//! 1. **[`budget`]** — [`ContextBudget`] computes the ceiling (window minus
//!    output reserve minus safety margin) and [`TokenEstimator`] turns
//!    characters into tokens.
//!
//! 2. **[`units`]** — splits history into atomic units so a tool request and
//!    its results are always kept or dropped together.
//!
//! 3. **[`window`]** — [`ContextWindowManager`] composes the snapshot:
//!    - **Pinned** — the session instruction, never reduced.
//!    - **Summary** — running summary of aged turns, injected as a user item
//!      plus an acknowledgement.
//!    - **Recent turns** — sliding window, oversize truncation, oldest-unit
//!      dropping, then content shrinking of the newest unit.
//!
//! 4. **[`summarizer`]** — incremental summarization state, run by the loop
//!    controller as a side call before composition.
//!
//! 5. **[`snapshot`]** — items with SHA-256 fingerprints, the basis for
//!    prompt-cache validity checks.

pub mod budget;
pub mod snapshot;
pub mod summarizer;
pub mod truncate;
pub mod units;
pub mod window;

pub use budget::{Capacity, ContextBudget, ContextUsage, DEFAULT_CHARS_PER_TOKEN, TokenEstimator};
pub use snapshot::{ContextItem, ContextSnapshot, ItemOrigin, PinnedInstruction};
pub use summarizer::{Summarizer, SummarizerConfig, SummaryPlan};
pub use window::{ContextWindowManager, SlidingWindow};
