//! Token budget: estimation and the ceiling every snapshot must respect.
//!
//! The ceiling is the model's context window minus the tokens reserved for
//! the model's own output minus a safety margin for estimation error. Usage
//! against that ceiling is reported as a [`ContextUsage`] with a coarse
//! [`Capacity`] tag.

use crate::history::TurnContent;

/// Default characters per token. Most tokenizers average 3-4 characters per
/// token for English; 4 matches the common `len / 4` rule of thumb.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 4.0;

/// Default context window size in tokens.
const DEFAULT_CONTEXT_WINDOW: usize = 128_000;

/// Default safety margin in tokens.
const DEFAULT_SAFETY_MARGIN: usize = 1_000;

const ELEVATED_THRESHOLD: f64 = 0.60;
const CRITICAL_THRESHOLD: f64 = 0.80;

// ── Estimation ─────────────────────────────────────────────────────

/// Character-ratio token estimator. Rounds up so estimates err on the side
/// of using more budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenEstimator {
    chars_per_token: f64,
}

impl TokenEstimator {
    /// Create an estimator. Non-positive or non-finite ratios fall back to
    /// [`DEFAULT_CHARS_PER_TOKEN`].
    pub fn new(chars_per_token: f64) -> Self {
        let chars_per_token = if chars_per_token.is_finite() && chars_per_token > 0.0 {
            chars_per_token
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        Self { chars_per_token }
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }

    /// Estimated tokens for `chars` characters.
    pub fn estimate_chars(&self, chars: usize) -> usize {
        (chars as f64 / self.chars_per_token).ceil() as usize
    }

    /// Estimated tokens for a string.
    pub fn estimate(&self, text: &str) -> usize {
        self.estimate_chars(text.chars().count())
    }

    /// Estimated tokens for a turn's content.
    pub fn estimate_content(&self, content: &TurnContent) -> usize {
        self.estimate_chars(content.char_len())
    }

    /// Characters that fit in `tokens` tokens.
    pub fn chars_for_tokens(&self, tokens: usize) -> usize {
        (tokens as f64 * self.chars_per_token).floor() as usize
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

// ── Budget ─────────────────────────────────────────────────────────

/// Token budget for one model call.
///
/// # Example
///
/// ```
/// use tether_rs::context::ContextBudget;
///
/// let budget = ContextBudget::new(8_000)
///     .with_output_reserve(1_024)
///     .with_safety_margin(500);
/// assert_eq!(budget.ceiling(), 6_476);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ContextBudget {
    /// Model context window in tokens.
    window_tokens: usize,
    /// Tokens reserved for the model's output.
    output_reserve: usize,
    /// Tokens held back to absorb estimation error.
    safety_margin: usize,
}

impl ContextBudget {
    pub fn new(window_tokens: usize) -> Self {
        Self {
            window_tokens,
            output_reserve: 0,
            safety_margin: DEFAULT_SAFETY_MARGIN,
        }
    }

    /// Set tokens reserved for model output (the per-response limit).
    pub fn with_output_reserve(mut self, tokens: usize) -> Self {
        self.output_reserve = tokens;
        self
    }

    /// Set tokens held back as a safety margin.
    pub fn with_safety_margin(mut self, tokens: usize) -> Self {
        self.safety_margin = tokens;
        self
    }

    pub fn window_tokens(&self) -> usize {
        self.window_tokens
    }

    pub fn output_reserve(&self) -> usize {
        self.output_reserve
    }

    pub fn safety_margin(&self) -> usize {
        self.safety_margin
    }

    /// Maximum tokens a snapshot may contain.
    pub fn ceiling(&self) -> usize {
        self.window_tokens
            .saturating_sub(self.output_reserve)
            .saturating_sub(self.safety_margin)
    }

    /// Usage report for a snapshot of `tokens` tokens.
    pub fn usage(&self, tokens: usize) -> ContextUsage {
        let ceiling = self.ceiling();
        let usage_pct = if ceiling > 0 {
            tokens as f64 / ceiling as f64
        } else {
            1.0
        };
        ContextUsage {
            estimated_tokens: tokens,
            ceiling,
            usage_pct,
        }
    }
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_WINDOW)
    }
}

// ── Usage ──────────────────────────────────────────────────────────

/// Coarse fill level of a snapshot relative to the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// Below 60% of the ceiling.
    Comfortable,
    /// 60% to 80%.
    Elevated,
    /// 80% and above.
    Critical,
}

/// Snapshot of context usage at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextUsage {
    /// Estimated tokens consumed.
    pub estimated_tokens: usize,
    /// Budget ceiling.
    pub ceiling: usize,
    /// Usage as a fraction of the ceiling (0.0 to 1.0+).
    pub usage_pct: f64,
}

impl ContextUsage {
    pub fn capacity(&self) -> Capacity {
        if self.usage_pct >= CRITICAL_THRESHOLD {
            Capacity::Critical
        } else if self.usage_pct >= ELEVATED_THRESHOLD {
            Capacity::Elevated
        } else {
            Capacity::Comfortable
        }
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "context: ~{} tokens ({:.0}% of {})",
            self.estimated_tokens,
            self.usage_pct * 100.0,
            self.ceiling
        )
    }
}
