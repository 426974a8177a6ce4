//! Snapshot composition under a token ceiling.
//!
//! [`ContextWindowManager::compose`] turns the pinned instruction, the
//! running summary and the unsummarized turns into a [`ContextSnapshot`]
//! whose token total never exceeds [`ContextBudget::ceiling`]. Reductions
//! run in a fixed order and only ever remove or shorten whole atomic units,
//! so a tool request is never sent without its results or the reverse.

use std::cmp::Reverse;

use tracing::debug;

use crate::error::ContextError;
use crate::history::{Role, Turn, TurnContent};

use super::budget::{ContextBudget, TokenEstimator};
use super::snapshot::{
    ContextItem, ContextSnapshot, ItemOrigin, PinnedInstruction, SUMMARY_ACK, SUMMARY_CLOSE_TAG,
    SUMMARY_OPEN_TAG,
};
use super::truncate::truncate_text;
use super::units::{Unit, atomic_units};

/// Proactive retention policy: keep only the newest units within these
/// limits. The newest unit is always kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlidingWindow {
    pub max_turns: Option<usize>,
    pub max_tokens: Option<usize>,
}

impl SlidingWindow {
    pub fn turns(max_turns: usize) -> Self {
        Self {
            max_turns: Some(max_turns),
            max_tokens: None,
        }
    }

    pub fn tokens(max_tokens: usize) -> Self {
        Self {
            max_turns: None,
            max_tokens: Some(max_tokens),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Index of the oldest unit to keep.
    fn first_kept(&self, units: &[Unit]) -> usize {
        let mut turns = 0;
        let mut tokens = 0;
        let mut first = units.len();
        for (idx, unit) in units.iter().enumerate().rev() {
            let next_turns = turns + unit.len();
            let next_tokens = tokens + unit.tokens;
            let over = self.max_turns.is_some_and(|max| next_turns > max)
                || self.max_tokens.is_some_and(|max| next_tokens > max);
            if over && first < units.len() {
                break;
            }
            turns = next_turns;
            tokens = next_tokens;
            first = idx;
        }
        first
    }
}

/// Composes context snapshots for one session.
#[derive(Debug, Clone)]
pub struct ContextWindowManager {
    budget: ContextBudget,
    estimator: TokenEstimator,
    sliding_window: Option<SlidingWindow>,
}

impl ContextWindowManager {
    pub fn new(budget: ContextBudget) -> Self {
        Self {
            budget,
            estimator: TokenEstimator::default(),
            sliding_window: None,
        }
    }

    pub fn with_estimator(mut self, estimator: TokenEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_sliding_window(mut self, window: Option<SlidingWindow>) -> Self {
        self.sliding_window = window;
        self
    }

    pub fn budget(&self) -> &ContextBudget {
        &self.budget
    }

    pub fn estimator(&self) -> &TokenEstimator {
        &self.estimator
    }

    /// Tokens the unreduced input would take: pinned text, summary items and
    /// every turn.
    pub fn raw_tokens(&self, pinned: &str, summary: Option<&str>, turns: &[Turn]) -> usize {
        let summary_tokens: usize = summary
            .map(|s| self.summary_items(s).iter().map(|i| i.tokens).sum())
            .unwrap_or(0);
        self.estimator.estimate(pinned)
            + summary_tokens
            + turns.iter().map(Turn::token_count).sum::<usize>()
    }

    /// Build the snapshot for the next model call.
    ///
    /// Order: pinned instruction, summary, sliding window, oversize-turn
    /// truncation, oldest-unit dropping, newest-unit shrinking. Fails with
    /// [`ContextError::PinnedTooLarge`] when the pinned instruction alone is
    /// over the ceiling and [`ContextError::Overflow`] when every reduction
    /// has run and the snapshot still does not fit.
    pub fn compose(
        &self,
        pinned: &str,
        summary: Option<&str>,
        turns: &[Turn],
    ) -> Result<ContextSnapshot, ContextError> {
        let ceiling = self.budget.ceiling();
        let pinned = PinnedInstruction::new(pinned, self.estimator.estimate(pinned));
        if pinned.tokens > ceiling {
            return Err(ContextError::PinnedTooLarge {
                pinned: pinned.tokens,
                ceiling,
            });
        }

        let summary_items: Vec<ContextItem> = summary
            .map(|s| self.summary_items(s).to_vec())
            .unwrap_or_default();
        let fixed = pinned.tokens + summary_items.iter().map(|i| i.tokens).sum::<usize>();
        if fixed > ceiling {
            return Err(ContextError::Overflow {
                required: fixed,
                ceiling,
            });
        }
        let available = ceiling - fixed;

        let units = atomic_units(turns);
        let first_kept = self
            .sliding_window
            .map_or(0, |window| window.first_kept(&units));
        let mut dropped_units = first_kept;

        let mut kept: Vec<Vec<ContextItem>> = units[first_kept..]
            .iter()
            .map(|u| turns[u.start..u.end].iter().map(ContextItem::from_turn).collect())
            .collect();

        // A single turn larger than everything left after pinned content can
        // never be sent whole.
        for item in kept.iter_mut().flatten() {
            if item.tokens > available {
                let source = item.content.clone();
                self.shrink_item(item, &source, available);
            }
        }

        let mut total: usize = kept.iter().flatten().map(|i| i.tokens).sum();
        let mut drop_count = 0;
        while total > available && kept.len() - drop_count > 1 {
            total -= kept[drop_count].iter().map(|i| i.tokens).sum::<usize>();
            drop_count += 1;
        }
        kept.drain(..drop_count);
        dropped_units += drop_count;

        if total > available
            && let Some(newest) = kept.last_mut()
        {
            let mut order: Vec<usize> = (0..newest.len()).collect();
            order.sort_by_key(|&i| Reverse(newest[i].tokens));
            for i in order {
                if total <= available {
                    break;
                }
                let item = &mut newest[i];
                let Some(source) = source_content(turns, item) else {
                    continue;
                };
                let before = item.tokens;
                let target = before.saturating_sub(total - available);
                if self.shrink_item(item, source, target) {
                    total = total - before + item.tokens;
                }
            }
        }

        if total > available {
            return Err(ContextError::Overflow {
                required: fixed + total,
                ceiling,
            });
        }

        let pinned_items = summary_items.len();
        let newest_len = kept.last().map_or(0, Vec::len);
        let mut items = summary_items;
        items.extend(kept.into_iter().flatten());
        let newest_unit_start = items.len() - newest_len;
        let truncated_turns = items.iter().filter(|i| i.truncated).count();
        let total_tokens = fixed + total;

        if dropped_units > 0 || truncated_turns > 0 {
            debug!(
                "[context] reduced: {dropped_units} unit(s) dropped, {truncated_turns} turn(s) truncated"
            );
        }

        Ok(ContextSnapshot {
            pinned_instruction: pinned,
            items,
            pinned_items,
            newest_unit_start,
            total_tokens,
            usage: self.budget.usage(total_tokens),
            dropped_units,
            truncated_turns,
        })
    }

    /// Summary as a user item plus an assistant acknowledgement.
    fn summary_items(&self, summary: &str) -> [ContextItem; 2] {
        let wrapped = TurnContent::text(format!(
            "{SUMMARY_OPEN_TAG}\n{summary}\n{SUMMARY_CLOSE_TAG}"
        ));
        let ack = TurnContent::text(SUMMARY_ACK);
        [
            ContextItem::new(
                Role::User,
                wrapped.clone(),
                self.estimator.estimate_content(&wrapped),
                ItemOrigin::Summary,
            ),
            ContextItem::new(
                Role::Assistant,
                ack.clone(),
                self.estimator.estimate_content(&ack),
                ItemOrigin::Summary,
            ),
        ]
    }

    /// Replace an item's content with `source` cut to at most `max_tokens`.
    /// Returns whether the item got smaller.
    fn shrink_item(&self, item: &mut ContextItem, source: &TurnContent, max_tokens: usize) -> bool {
        let Some(content) = self.shrink_content(source, max_tokens) else {
            return false;
        };
        let tokens = self.estimator.estimate_content(&content);
        if tokens >= item.tokens {
            return false;
        }
        item.replace_content(content, tokens);
        true
    }

    fn shrink_content(&self, content: &TurnContent, max_tokens: usize) -> Option<TurnContent> {
        let max_chars = self.estimator.chars_for_tokens(max_tokens);
        match content {
            TurnContent::Text(text) => Some(TurnContent::Text(
                truncate_text(text, max_chars).into_owned(),
            )),
            TurnContent::ToolResult {
                call_id,
                tool_name,
                output,
                error,
            } => {
                let room = max_chars.saturating_sub(tool_name.chars().count());
                Some(TurnContent::ToolResult {
                    call_id: call_id.clone(),
                    tool_name: tool_name.clone(),
                    output: truncate_text(output, room).into_owned(),
                    error: *error,
                })
            }
            // Call arguments are left intact; only the prose can shrink.
            TurnContent::ToolRequest {
                text: Some(text),
                calls,
            } => {
                let call_chars: usize = calls
                    .iter()
                    .map(|c| c.name().chars().count() + c.arguments().chars().count())
                    .sum();
                let room = max_chars.saturating_sub(call_chars);
                Some(TurnContent::ToolRequest {
                    text: Some(truncate_text(text, room).into_owned()),
                    calls: calls.clone(),
                })
            }
            TurnContent::ToolRequest { text: None, .. } => None,
        }
    }
}

/// Untruncated content of the turn an item was built from.
fn source_content<'a>(turns: &'a [Turn], item: &ContextItem) -> Option<&'a TurnContent> {
    let ItemOrigin::Turn(seq) = item.origin else {
        return None;
    };
    let first = turns.first()?.sequence();
    let idx = usize::try_from(seq.checked_sub(first)?).ok()?;
    turns.get(idx).map(Turn::content)
}
