//! Configuration types for the [`AgentRuntime`](super::AgentRuntime).
//!
//! The iteration ceiling is a required constructor argument; there is no
//! unbounded default. Everything else has a default and a `with_*` builder.
//! Optional modules (summarization, prompt caching) are wrapped in a
//! [`Toggle`].
//!
//! # Examples
//!
//! ```
//! use std::num::NonZeroU32;
//! use std::time::Duration;
//! use tether_rs::agent::{RuntimeConfig, Toggle};
//! use tether_rs::context::SummarizerConfig;
//!
//! let config = RuntimeConfig::new("anthropic/claude-sonnet-4", NonZeroU32::new(20).unwrap())
//!     .with_max_output_tokens(4096)
//!     .with_temperature(0.3)
//!     .with_session_timeout(Duration::from_secs(300))
//!     .with_summarization(Toggle::enabled(SummarizerConfig::default()));
//! assert!(config.validate().is_ok());
//! ```
//!
//! Configuration can also be read from a JSON file and layered over a
//! programmatic config with [`ConfigFile`].

use std::num::NonZeroU32;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::api::retry::RetryConfig;
use crate::api::tracing::{ModelPricing, pricing_for_model};
use crate::cache::CacheConfig;
use crate::context::{
    ContextBudget, ContextWindowManager, DEFAULT_CHARS_PER_TOKEN, SlidingWindow, SummarizerConfig,
    TokenEstimator,
};
use crate::error::RuntimeError;
use crate::tools::{DEFAULT_MAX_RESULT_BYTES, DEFAULT_TOOL_TIMEOUT};

// ── Generic toggle ────────────────────────────────────────────────

/// Generic enabled/disabled wrapper for module configurations.
///
/// When `enabled` is `false`, the module is skipped regardless of the inner
/// config values.
#[derive(Debug, Clone, PartialEq)]
pub struct Toggle<T: Default> {
    /// Whether this module is active.
    pub enabled: bool,
    /// Module-specific configuration.
    pub config: T,
}

impl<T: Default> Toggle<T> {
    pub fn enabled(config: T) -> Self {
        Self {
            enabled: true,
            config,
        }
    }

    /// Create a disabled instance with default inner config.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            config: T::default(),
        }
    }
}

impl<T: Default> Default for Toggle<T> {
    fn default() -> Self {
        Self {
            enabled: true,
            config: T::default(),
        }
    }
}

// ── Context config ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ContextConfig {
    /// Model context window in tokens.
    pub window_tokens: usize,
    /// Tokens reserved for the response. `None` reserves `max_output_tokens`.
    pub output_reserve: Option<usize>,
    pub safety_margin: usize,
    pub chars_per_token: f64,
    /// Proactive retention policy applied before reactive truncation.
    pub sliding_window: Option<SlidingWindow>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            window_tokens: 128_000,
            output_reserve: None,
            safety_margin: 1_000,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
            sliding_window: None,
        }
    }
}

// ── Memory config ─────────────────────────────────────────────────

/// Keys read from and written to the external memory store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryConfig {
    /// Read at session start; each value becomes a pinned document.
    pub load_keys: Vec<String>,
    /// Written at session end with the summary, or the last answer.
    pub save_key: Option<String>,
}

// ── Runtime config ────────────────────────────────────────────────

/// Configuration for an [`AgentRuntime`](super::AgentRuntime).
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Model identifier (e.g. `"anthropic/claude-sonnet-4"`).
    pub model: String,
    /// Hard ceiling on model calls per run.
    pub max_iterations: NonZeroU32,
    /// Maximum tokens per model response.
    pub max_output_tokens: u32,
    pub temperature: f32,
    /// Timeout for each model call attempt. Retries get a fresh timeout;
    /// the session timeout bounds the total.
    pub model_call_timeout: Duration,
    /// Default per-call tool timeout.
    pub tool_timeout: Duration,
    /// Wall-clock budget for one run.
    pub session_timeout: Duration,
    /// Identical consecutive tool failures that abort the session.
    pub failure_threshold: u32,
    /// Run the tool calls of one response concurrently.
    pub concurrent_tools: bool,
    /// Tool results longer than this are truncated with a marker.
    pub max_result_bytes: usize,
    /// Retry configuration for transient endpoint failures.
    pub retry: RetryConfig,
    pub context: ContextConfig,
    /// Summarization of aged turns. Disabled by default.
    pub summarization: Toggle<SummarizerConfig>,
    /// Explicit prompt caching. Only takes effect with a cache backend.
    pub cache: Toggle<CacheConfig>,
    pub memory: MemoryConfig,
    /// Pricing for cost estimates. `None` looks the model up by name.
    pub pricing: Option<ModelPricing>,
}

impl RuntimeConfig {
    /// Create a config with a model and an iteration ceiling.
    pub fn new(model: impl Into<String>, max_iterations: NonZeroU32) -> Self {
        Self {
            model: model.into(),
            max_iterations,
            max_output_tokens: 1024,
            temperature: 0.7,
            model_call_timeout: Duration::from_secs(120),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            session_timeout: Duration::from_secs(600),
            failure_threshold: 3,
            concurrent_tools: true,
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
            retry: RetryConfig::default(),
            context: ContextConfig::default(),
            summarization: Toggle::disabled(),
            cache: Toggle::default(),
            memory: MemoryConfig::default(),
            pricing: None,
        }
    }

    // ── Builder methods ───────────────────────────────────────────

    pub fn with_max_iterations(mut self, max: NonZeroU32) -> Self {
        self.max_iterations = max;
        self
    }

    /// Set the maximum tokens per model response.
    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_model_call_timeout(mut self, timeout: Duration) -> Self {
        self.model_call_timeout = timeout;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Run a response's tool calls one at a time instead of concurrently.
    pub fn with_sequential_tools(mut self) -> Self {
        self.concurrent_tools = false;
        self
    }

    pub fn with_max_result_bytes(mut self, bytes: usize) -> Self {
        self.max_result_bytes = bytes;
        self
    }

    /// Retry transient endpoint failures up to `max_retries` times. `0`
    /// disables retries.
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retry = RetryConfig::with_retries(max_retries);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_context_window(mut self, window_tokens: usize) -> Self {
        self.context.window_tokens = window_tokens;
        self
    }

    pub fn with_output_reserve(mut self, tokens: usize) -> Self {
        self.context.output_reserve = Some(tokens);
        self
    }

    pub fn with_safety_margin(mut self, tokens: usize) -> Self {
        self.context.safety_margin = tokens;
        self
    }

    pub fn with_chars_per_token(mut self, ratio: f64) -> Self {
        self.context.chars_per_token = ratio;
        self
    }

    pub fn with_sliding_window(mut self, window: SlidingWindow) -> Self {
        self.context.sliding_window = Some(window);
        self
    }

    pub fn with_summarization(mut self, summarization: Toggle<SummarizerConfig>) -> Self {
        self.summarization = summarization;
        self
    }

    pub fn with_cache(mut self, cache: Toggle<CacheConfig>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = Some(pricing);
        self
    }

    // ── Derived values ────────────────────────────────────────────

    pub fn budget(&self) -> ContextBudget {
        ContextBudget::new(self.context.window_tokens)
            .with_output_reserve(
                self.context
                    .output_reserve
                    .unwrap_or(self.max_output_tokens as usize),
            )
            .with_safety_margin(self.context.safety_margin)
    }

    pub fn estimator(&self) -> TokenEstimator {
        TokenEstimator::new(self.context.chars_per_token)
    }

    /// The window manager this config describes.
    pub fn window_manager(&self) -> ContextWindowManager {
        ContextWindowManager::new(self.budget())
            .with_estimator(self.estimator())
            .with_sliding_window(self.context.sliding_window)
    }

    pub fn model_pricing(&self) -> ModelPricing {
        self.pricing
            .clone()
            .unwrap_or_else(|| pricing_for_model(&self.model))
    }

    /// Reject settings that would make every session fail or hang.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        let fail = |msg: &str| Err(RuntimeError::Configuration(msg.to_string()));
        if self.model.trim().is_empty() {
            return fail("model must not be empty");
        }
        if self.failure_threshold == 0 {
            return fail("failure_threshold must be at least 1");
        }
        if self.model_call_timeout.is_zero()
            || self.tool_timeout.is_zero()
            || self.session_timeout.is_zero()
        {
            return fail("timeouts must be non-zero");
        }
        if self.summarization.enabled && self.summarization.config.timeout.is_zero() {
            return fail("summarization timeout must be non-zero");
        }
        if self.budget().ceiling() == 0 {
            return Err(RuntimeError::Configuration(format!(
                "context window of {} tokens leaves no room after the output reserve and safety margin",
                self.context.window_tokens
            )));
        }
        Ok(())
    }
}

// ── File configuration ────────────────────────────────────────────

/// JSON configuration file. Every field is optional; durations are seconds.
///
/// ```json
/// {
///   "model": "anthropic/claude-sonnet-4",
///   "max_iterations": 15,
///   "session_timeout_secs": 300,
///   "summarization": { "enabled": true, "retain_recent_turns": 8 },
///   "cache": { "enabled": true, "min_tokens": 2048 }
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub model: Option<String>,
    pub max_iterations: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub model_call_timeout_secs: Option<u64>,
    pub tool_timeout_secs: Option<u64>,
    pub session_timeout_secs: Option<u64>,
    pub failure_threshold: Option<u32>,
    pub concurrent_tools: Option<bool>,
    pub max_result_bytes: Option<usize>,
    pub max_retries: Option<u32>,
    pub window_tokens: Option<usize>,
    pub output_reserve: Option<usize>,
    pub safety_margin: Option<usize>,
    pub chars_per_token: Option<f64>,
    pub sliding_window_turns: Option<usize>,
    pub sliding_window_tokens: Option<usize>,
    pub summarization: Option<SummarizationSection>,
    pub cache: Option<CacheSection>,
    pub memory_load_keys: Option<Vec<String>>,
    pub memory_save_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SummarizationSection {
    pub enabled: Option<bool>,
    pub model: Option<String>,
    pub retain_recent_turns: Option<usize>,
    pub trigger_turns: Option<usize>,
    pub max_summary_tokens: Option<u32>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CacheSection {
    pub enabled: Option<bool>,
    pub min_tokens: Option<usize>,
    pub ttl_secs: Option<u64>,
    pub extended_ttl_secs: Option<u64>,
    pub cache_conversation: Option<bool>,
}

impl ConfigFile {
    /// Read and parse a JSON config file.
    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&content).map_err(|e| match e {
            RuntimeError::Configuration(msg) => {
                RuntimeError::Configuration(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self, RuntimeError> {
        serde_json::from_str(content)
            .map_err(|e| RuntimeError::Configuration(format!("invalid config: {e}")))
    }

    /// Layer the values present in this file over `config`.
    pub fn apply(&self, mut config: RuntimeConfig) -> Result<RuntimeConfig, RuntimeError> {
        if let Some(ref model) = self.model {
            config.model = model.clone();
        }
        if let Some(max) = self.max_iterations {
            config.max_iterations = NonZeroU32::new(max).ok_or_else(|| {
                RuntimeError::Configuration("max_iterations must be at least 1".into())
            })?;
        }
        if let Some(v) = self.max_output_tokens {
            config.max_output_tokens = v;
        }
        if let Some(v) = self.temperature {
            config.temperature = v;
        }
        if let Some(v) = self.model_call_timeout_secs {
            config.model_call_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.tool_timeout_secs {
            config.tool_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.session_timeout_secs {
            config.session_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.failure_threshold {
            config.failure_threshold = v;
        }
        if let Some(v) = self.concurrent_tools {
            config.concurrent_tools = v;
        }
        if let Some(v) = self.max_result_bytes {
            config.max_result_bytes = v;
        }
        if let Some(v) = self.max_retries {
            config.retry.max_retries = v;
        }
        if let Some(v) = self.window_tokens {
            config.context.window_tokens = v;
        }
        if let Some(v) = self.output_reserve {
            config.context.output_reserve = Some(v);
        }
        if let Some(v) = self.safety_margin {
            config.context.safety_margin = v;
        }
        if let Some(v) = self.chars_per_token {
            config.context.chars_per_token = v;
        }
        match (self.sliding_window_turns, self.sliding_window_tokens) {
            (Some(turns), tokens) => {
                let mut window = SlidingWindow::turns(turns);
                if let Some(tokens) = tokens {
                    window = window.with_max_tokens(tokens);
                }
                config.context.sliding_window = Some(window);
            }
            (None, Some(tokens)) => config.context.sliding_window = Some(SlidingWindow::tokens(tokens)),
            (None, None) => {}
        }
        if let Some(ref s) = self.summarization {
            let target = &mut config.summarization;
            target.enabled = s.enabled.unwrap_or(true);
            if let Some(ref model) = s.model {
                target.config.model = Some(model.clone());
            }
            if let Some(v) = s.retain_recent_turns {
                target.config.retain_recent_turns = v;
            }
            if let Some(v) = s.trigger_turns {
                target.config.trigger_turns = v;
            }
            if let Some(v) = s.max_summary_tokens {
                target.config.max_summary_tokens = v;
            }
            if let Some(v) = s.timeout_secs {
                target.config.timeout = Duration::from_secs(v);
            }
        }
        if let Some(ref c) = self.cache {
            let target = &mut config.cache;
            target.enabled = c.enabled.unwrap_or(true);
            if let Some(v) = c.min_tokens {
                target.config.min_tokens = v;
            }
            if let Some(v) = c.ttl_secs {
                target.config.ttl = Duration::from_secs(v);
            }
            if let Some(v) = c.extended_ttl_secs {
                target.config.extended_ttl = Duration::from_secs(v);
            }
            if let Some(v) = c.cache_conversation {
                target.config.cache_conversation = v;
            }
        }
        if let Some(ref keys) = self.memory_load_keys {
            config.memory.load_keys = keys.clone();
        }
        if let Some(ref key) = self.memory_save_key {
            config.memory.save_key = Some(key.clone());
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base() -> RuntimeConfig {
        RuntimeConfig::new("m", NonZeroU32::new(5).unwrap())
    }

    #[test]
    fn defaults() {
        let config = base();
        assert_eq!(config.max_output_tokens, 1024);
        assert_eq!(config.failure_threshold, 3);
        assert!(config.concurrent_tools);
        assert!(!config.summarization.enabled);
        assert!(config.cache.enabled);
        // 128k window minus 1024 reserve minus 1000 margin.
        assert_eq!(config.budget().ceiling(), 125_976);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn explicit_output_reserve_overrides_max_tokens() {
        let config = base()
            .with_context_window(1000)
            .with_output_reserve(100)
            .with_safety_margin(0);
        assert_eq!(config.budget().ceiling(), 900);
    }

    #[test]
    fn validate_rejects_degenerate_settings() {
        assert!(base().with_failure_threshold(0).validate().is_err());
        assert!(base().with_tool_timeout(Duration::ZERO).validate().is_err());
        let err = base()
            .with_context_window(1000)
            .with_max_output_tokens(1000)
            .validate()
            .unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION");
    }

    #[test]
    fn toggle_constructors() {
        let on = Toggle::enabled(SummarizerConfig::default().with_trigger_turns(4));
        assert!(on.enabled);
        assert_eq!(on.config.trigger_turns, 4);
        assert!(!Toggle::<SummarizerConfig>::disabled().enabled);
    }

    #[test]
    fn file_config_layers_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "model": "other/model",
                "max_iterations": 9,
                "session_timeout_secs": 30,
                "sliding_window_turns": 10,
                "summarization": {{ "retain_recent_turns": 2 }},
                "cache": {{ "enabled": false }},
                "memory_save_key": "notes"
            }}"#
        )
        .unwrap();

        let parsed = ConfigFile::load(file.path()).unwrap();
        let config = parsed.apply(base()).unwrap();
        assert_eq!(config.model, "other/model");
        assert_eq!(config.max_iterations.get(), 9);
        assert_eq!(config.session_timeout, Duration::from_secs(30));
        assert_eq!(config.context.sliding_window, Some(SlidingWindow::turns(10)));
        assert!(config.summarization.enabled);
        assert_eq!(config.summarization.config.retain_recent_turns, 2);
        assert!(!config.cache.enabled);
        assert_eq!(config.memory.save_key.as_deref(), Some("notes"));
        // Untouched fields keep their values.
        assert_eq!(config.max_output_tokens, 1024);
    }

    #[test]
    fn file_config_rejects_zero_iterations_and_unknown_fields() {
        let zero = ConfigFile::parse(r#"{"max_iterations": 0}"#).unwrap();
        assert!(zero.apply(base()).is_err());
        assert!(ConfigFile::parse(r#"{"max_rounds": 3}"#).is_err());
    }

    #[test]
    fn missing_file_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigFile::load(&dir.path().join("nope.json")).unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION");
    }
}
