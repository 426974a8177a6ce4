//! Prompt chaining: a fixed sequence of single-call steps.
//!
//! Each step sends one tool-less request with its own system prompt. The
//! step's input template receives the previous step's output as `{input}`.
//! A gate between steps can reject an output and stop the chain before the
//! next call is spent on it.
//!
//! ```ignore
//! let chain = PromptChain::new("anthropic/claude-sonnet-4")
//!     .step(ChainStep::new("outline", "You write outlines.", "Outline: {input}")
//!         .with_gate(min_numbered_points(3)))
//!     .step(ChainStep::new("draft", "You expand outlines.", "Expand:\n{input}"));
//!
//! let result = chain.run(endpoint.as_ref(), "Rust error handling").await?;
//! println!("{}", result.output);
//! ```

use std::sync::Arc;

use tracing::{debug, info};

use crate::api::retry::{RetryConfig, retry_model_call};
use crate::api::{ModelEndpoint, ModelRequest, Usage};
use crate::error::ModelError;

/// Validation applied to a step's output. Returns the rejection reason.
pub type Gate = Arc<dyn Fn(&str) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChainError {
    #[error("step '{step}' output rejected: {reason}")]
    GateFailed { step: String, reason: String },
    #[error("step '{step}' failed: {source}")]
    Model { step: String, source: ModelError },
    #[error("step '{0}' returned no text")]
    EmptyOutput(String),
}

/// One step of a [`PromptChain`].
#[derive(Clone)]
pub struct ChainStep {
    pub name: String,
    pub system_prompt: String,
    /// `{input}` is replaced with the previous output.
    pub input_template: String,
    gate: Option<Gate>,
}

impl std::fmt::Debug for ChainStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainStep")
            .field("name", &self.name)
            .field("gated", &self.gate.is_some())
            .finish()
    }
}

impl ChainStep {
    pub fn new(
        name: impl Into<String>,
        system_prompt: impl Into<String>,
        input_template: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            input_template: input_template.into(),
            gate: None,
        }
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    fn render(&self, input: &str) -> String {
        self.input_template.replace("{input}", input)
    }
}

/// Output of a completed chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainResult {
    pub output: String,
    /// Output of every step, in order.
    pub steps: Vec<String>,
    pub usage: Usage,
}

/// Sequential single-call steps against one endpoint.
#[derive(Debug, Clone)]
pub struct PromptChain {
    model: String,
    steps: Vec<ChainStep>,
    max_output_tokens: u32,
    temperature: f32,
    retry: RetryConfig,
}

impl PromptChain {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            steps: Vec::new(),
            max_output_tokens: 1024,
            temperature: 0.7,
            retry: RetryConfig::default(),
        }
    }

    pub fn step(mut self, step: ChainStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order. The first step receives `input`.
    pub async fn run(
        &self,
        endpoint: &dyn ModelEndpoint,
        input: &str,
    ) -> Result<ChainResult, ChainError> {
        let mut current = input.to_string();
        let mut outputs = Vec::with_capacity(self.steps.len());
        let mut usage = Usage::default();

        for (i, step) in self.steps.iter().enumerate() {
            debug!("[chain] step {}/{}: {}", i + 1, self.steps.len(), step.name);
            let request = ModelRequest::single_turn(
                self.model.clone(),
                step.system_prompt.clone(),
                step.render(&current),
                self.max_output_tokens,
                self.temperature,
            );
            let response = retry_model_call(&self.retry, || endpoint.complete(&request))
                .await
                .map_err(|source| ChainError::Model {
                    step: step.name.clone(),
                    source,
                })?;
            usage.add(&response.usage);

            let output = response
                .text
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| ChainError::EmptyOutput(step.name.clone()))?;
            if let Some(ref gate) = step.gate {
                gate(&output).map_err(|reason| {
                    info!("[chain] gate after '{}' rejected output: {reason}", step.name);
                    ChainError::GateFailed {
                        step: step.name.clone(),
                        reason,
                    }
                })?;
            }
            outputs.push(output.clone());
            current = output;
        }

        Ok(ChainResult {
            output: current,
            steps: outputs,
            usage,
        })
    }
}

// ── Gates ──────────────────────────────────────────────────────────

/// Accept output that parses as JSON, optionally inside a fenced block.
pub fn json_gate() -> Gate {
    Arc::new(|output: &str| {
        let body = strip_code_fence(output);
        serde_json::from_str::<serde_json::Value>(body)
            .map(|_| ())
            .map_err(|e| format!("output is not valid JSON: {e}"))
    })
}

/// Accept output with at least `n` lines starting with `1.`, `2.` and so on.
pub fn min_numbered_points(n: usize) -> Gate {
    Arc::new(move |output: &str| {
        let count = output
            .lines()
            .filter(|line| {
                let line = line.trim_start();
                let digits = line.chars().take_while(char::is_ascii_digit).count();
                digits > 0 && line.get(digits..).is_some_and(|rest| rest.starts_with(['.', ')']))
            })
            .count();
        if count >= n {
            Ok(())
        } else {
            Err(format!("expected at least {n} numbered points, found {count}"))
        }
    })
}

fn strip_code_fence(output: &str) -> &str {
    let trimmed = output.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.strip_suffix("```").unwrap_or(body).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ModelResponse, ScriptedEndpoint};

    #[tokio::test]
    async fn steps_feed_each_other() {
        let endpoint = ScriptedEndpoint::new()
            .then(ModelResponse::text("1. a\n2. b\n3. c"))
            .then(ModelResponse::text("final draft"));
        let chain = PromptChain::new("m")
            .step(
                ChainStep::new("outline", "outline", "Topic: {input}")
                    .with_gate(min_numbered_points(3)),
            )
            .step(ChainStep::new("draft", "draft", "Expand:\n{input}"));

        let result = chain.run(&endpoint, "rust").await.unwrap();
        assert_eq!(result.output, "final draft");
        assert_eq!(result.steps.len(), 2);

        let sent = endpoint.requests();
        assert_eq!(sent[0].messages()[1].content.as_deref(), Some("Topic: rust"));
        assert_eq!(
            sent[1].messages()[1].content.as_deref(),
            Some("Expand:\n1. a\n2. b\n3. c")
        );
    }

    #[tokio::test]
    async fn failing_gate_stops_the_chain() {
        let endpoint = ScriptedEndpoint::new()
            .then(ModelResponse::text("1. only one"))
            .then(ModelResponse::text("unused"));
        let chain = PromptChain::new("m")
            .step(ChainStep::new("outline", "s", "{input}").with_gate(min_numbered_points(3)))
            .step(ChainStep::new("draft", "s", "{input}"));

        let err = chain.run(&endpoint, "x").await.unwrap_err();
        assert!(matches!(err, ChainError::GateFailed { ref step, .. } if step == "outline"));
        assert_eq!(endpoint.call_count(), 1);
    }

    #[test]
    fn json_gate_accepts_fenced_json() {
        let gate = json_gate();
        assert!(gate("{\"a\": 1}").is_ok());
        assert!(gate("```json\n{\"a\": 1}\n```").is_ok());
        assert!(gate("not json").is_err());
    }

    #[test]
    fn numbered_points_accepts_parens() {
        let gate = min_numbered_points(2);
        assert!(gate("1) first\n2) second").is_ok());
        assert!(gate("- first\n- second").is_err());
    }
}
