//! Correlation IDs and cost tracking for sessions.
//!
//! Assigns a unique id to each session and a span id to each iteration within
//! it. Tracks cumulative token usage, split into fresh and cached input, and
//! the estimated cost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use super::endpoint::Usage;

/// Generate a unique session ID.
pub fn generate_session_id() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    // Use a counter to handle sub-nanosecond calls.
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("ses-{ts:x}-{count:04x}")
}

/// Generate a span ID for an iteration within a session.
pub fn generate_span_id(session_id: &str, iteration: u32) -> String {
    format!("{session_id}:i{iteration}")
}

/// Per-model pricing for cost estimation (USD per 1M tokens).
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPricing {
    /// Price per 1M fresh input tokens.
    pub input_per_million: f64,
    /// Price per 1M input tokens served from a prompt cache.
    pub cached_input_per_million: f64,
    /// Price per 1M output tokens.
    pub output_per_million: f64,
}

impl ModelPricing {
    /// Pricing with cached input at one quarter of fresh input.
    pub fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            cached_input_per_million: input_per_million / 4.0,
            output_per_million,
        }
    }

    /// Estimate cost for one call's usage.
    pub fn estimate_cost(&self, usage: &Usage) -> f64 {
        (usage.fresh_input_tokens as f64 / 1_000_000.0) * self.input_per_million
            + (usage.cached_input_tokens as f64 / 1_000_000.0) * self.cached_input_per_million
            + (usage.output_tokens as f64 / 1_000_000.0) * self.output_per_million
    }
}

impl Default for ModelPricing {
    fn default() -> Self {
        // Default to a mid-range estimate.
        Self::new(3.0, 15.0)
    }
}

/// Lookup approximate pricing for a model by name.
///
/// Matches on the model name segment (after the last `/` in paths like
/// `"anthropic/claude-sonnet-4"`) to avoid false positives from org
/// prefixes like `"my-org/custom-sonnet-finetune"`.
pub fn pricing_for_model(model: &str) -> ModelPricing {
    let name = model.rsplit('/').next().unwrap_or(model).to_lowercase();

    // Approximate list prices. Cost tracking is for spotting runaway
    // sessions, not billing.
    if name.contains("opus") {
        ModelPricing::new(15.0, 75.0)
    } else if name.contains("sonnet") {
        ModelPricing::new(3.0, 15.0)
    } else if name.contains("haiku") {
        ModelPricing::new(0.25, 1.25)
    } else if name.contains("4o-mini") {
        ModelPricing::new(0.15, 0.60)
    } else if name.contains("gpt-4") {
        ModelPricing::new(2.50, 10.0)
    } else if name.contains("gemini") && name.contains("flash") {
        ModelPricing::new(0.10, 0.40)
    } else if name.contains("gemini") {
        ModelPricing::new(1.25, 5.0)
    } else if name.contains("deepseek") {
        ModelPricing::new(0.27, 1.10)
    } else {
        ModelPricing::default()
    }
}

/// Cumulative cost tracker for one session.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CostTracker {
    pub total_fresh_input_tokens: u64,
    pub total_cached_input_tokens: u64,
    pub total_output_tokens: u64,
    pub estimated_cost_usd: f64,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record token usage for one model call.
    pub fn record(&mut self, usage: &Usage, pricing: &ModelPricing) {
        self.total_fresh_input_tokens += u64::from(usage.fresh_input_tokens);
        self.total_cached_input_tokens += u64::from(usage.cached_input_tokens);
        self.total_output_tokens += u64::from(usage.output_tokens);
        self.estimated_cost_usd += pricing.estimate_cost(usage);
    }

    /// Total tokens consumed.
    pub fn total_tokens(&self) -> u64 {
        self.total_fresh_input_tokens + self.total_cached_input_tokens + self.total_output_tokens
    }

    /// Format as a short summary string.
    pub fn summary(&self) -> String {
        format!(
            "tokens: {} fresh + {} cached input, {} output = {} total, est. cost: ${:.4}",
            self.total_fresh_input_tokens,
            self.total_cached_input_tokens,
            self.total_output_tokens,
            self.total_tokens(),
            self.estimated_cost_usd,
        )
    }
}
