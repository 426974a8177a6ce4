//! Run one agent session against OpenRouter and print the final answer.
//!
//! Reads the API key from the `OPENROUTER_KEY` environment variable.
//!
//! # Examples
//!
//! ```sh
//! # Single question, no tools
//! tether --user "Explain the borrow checker in two sentences"
//!
//! # Instruction from a file, tools from JSON, memory persisted between runs
//! tether --system-file persona.md --tools tools.json \
//!   --memory-dir .tether/memory --user "Check disk usage and summarize"
//!
//! # Pipe content from stdin, layered config, verbose logging
//! cat incident.log | tether --config tether.json --stdin -vv \
//!   --user "Find the root cause"
//! ```

use std::io::{self, Read};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tracing::info;

use tether_rs::agent::{AgentRuntime, ConfigFile, LoggingHandler, MemoryConfig, RuntimeConfig, Toggle};
use tether_rs::api::{DEFAULT_MODEL, OpenRouterClient};
use tether_rs::context::SummarizerConfig;
use tether_rs::memory::FileMemoryStore;
use tether_rs::tools::{Tool, ToolFuture, ToolRegistry};
use tether_rs::{FunctionDef, ToolDef, ToolType, logging};

/// Run one agent session and print the final answer.
///
/// Reads the API key from the OPENROUTER_KEY environment variable.
#[derive(Parser)]
#[command(name = "tether", version)]
struct Cli {
    // ── Content ────────────────────────────────────────────────
    /// Pinned instruction for the session
    #[arg(long, conflicts_with = "system_file")]
    system: Option<String>,

    /// Read the pinned instruction from a file
    #[arg(long)]
    system_file: Option<PathBuf>,

    /// User message to send
    #[arg(long)]
    user: Option<String>,

    /// Read user content from stdin
    #[arg(long)]
    stdin: bool,

    // ── Model and loop ─────────────────────────────────────────
    /// Model identifier
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    /// Hard ceiling on model calls
    #[arg(long, default_value_t = 10)]
    max_iterations: u32,

    /// Maximum tokens per model response
    #[arg(long)]
    max_tokens: Option<u32>,

    /// Sampling temperature
    #[arg(long)]
    temperature: Option<f32>,

    /// Wall-clock budget for the run, in seconds
    #[arg(long)]
    session_timeout: Option<u64>,

    /// Summarize aged turns instead of only truncating them
    #[arg(long)]
    summarize: bool,

    /// JSON config file layered over the flags above
    #[arg(long)]
    config: Option<PathBuf>,

    // ── Tools and memory ───────────────────────────────────────
    /// JSON file defining shell-command tools
    #[arg(long)]
    tools: Option<PathBuf>,

    /// Directory for the file-backed memory store
    #[arg(long)]
    memory_dir: Option<PathBuf>,

    /// Memory keys loaded into the pinned instruction
    #[arg(long = "load-memory")]
    load_memory: Vec<String>,

    /// Memory key the session summary or answer is saved under
    #[arg(long)]
    save_memory: Option<String>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

// ── Tool file types ────────────────────────────────────────────────

/// Tool definition loaded from the tools JSON file, with an `execute`
/// command template for local subprocess execution.
#[derive(Deserialize)]
struct ToolFileEntry {
    #[serde(rename = "type")]
    tool_type: ToolType,
    function: FunctionDef,
    /// Shell command template. Use {{param_name}} for argument substitution.
    execute: String,
    /// Per-call timeout in seconds.
    #[serde(default)]
    timeout_secs: Option<u64>,
}

/// A tool from the tools file that runs a shell command.
struct ShellCommandTool {
    def: ToolDef,
    template: String,
    timeout: Option<Duration>,
}

impl Tool for ShellCommandTool {
    fn definition(&self) -> ToolDef {
        self.def.clone()
    }

    fn execute(&self, input: serde_json::Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let name = self.def.name();
            let cmd = render_command(&self.template, &input);
            info!("[tool] {name}: {cmd}");

            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&cmd)
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| format!("failed to run '{name}': {e}"))?;

            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !output.status.success() {
                Err(format!(
                    "'{name}' exited with {}.\nstdout:\n{stdout}\nstderr:\n{stderr}",
                    output.status
                ))
            } else if stderr.is_empty() {
                Ok(stdout.into_owned())
            } else {
                Ok(format!("{stdout}\n\n[stderr]\n{stderr}"))
            }
        })
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

// ── Helpers ────────────────────────────────────────────────────────

fn build_user_content(cli: &Cli) -> Result<String, String> {
    let stdin_text = if cli.stdin {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| format!("failed to read stdin: {e}"))?;
        Some(buf)
    } else {
        None
    };

    match (&cli.user, stdin_text) {
        (Some(msg), Some(piped)) => Ok(format!("{msg}\n\n{piped}")),
        (Some(msg), None) => Ok(msg.clone()),
        (None, Some(piped)) => Ok(piped),
        (None, None) => Err("provide --user, --stdin, or both".to_string()),
    }
}

fn load_instruction(cli: &Cli) -> Result<String, String> {
    match (&cli.system, &cli.system_file) {
        (Some(text), _) => Ok(text.clone()),
        (None, Some(path)) => std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read '{}': {e}", path.display())),
        (None, None) => Ok("You are a helpful assistant.".to_string()),
    }
}

fn load_tools(path: &PathBuf) -> Result<ToolRegistry, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read tools file '{}': {e}", path.display()))?;
    let entries: Vec<ToolFileEntry> = serde_json::from_str(&content)
        .map_err(|e| format!("failed to parse tools file '{}': {e}", path.display()))?;

    let mut registry = ToolRegistry::new();
    for entry in entries {
        registry
            .register(ShellCommandTool {
                def: ToolDef {
                    tool_type: entry.tool_type,
                    function: entry.function,
                },
                template: entry.execute,
                timeout: entry.timeout_secs.map(Duration::from_secs),
            })
            .map_err(|e| e.to_string())?;
    }
    Ok(registry)
}

/// Substitute {{param}} placeholders and drop any left unfilled.
fn render_command(template: &str, input: &serde_json::Value) -> String {
    let mut cmd = template.to_string();
    if let Some(obj) = input.as_object() {
        for (key, value) in obj {
            let placeholder = format!("{{{{{key}}}}}");
            let replacement = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            cmd = cmd.replace(&placeholder, &replacement);
        }
    }

    let mut cleaned = String::with_capacity(cmd.len());
    let mut rest = cmd.as_str();
    while let Some((before, after)) = rest.split_once("{{") {
        cleaned.push_str(before);
        match after.split_once("}}") {
            Some((_, tail)) => rest = tail,
            None => {
                cleaned.push_str("{{");
                rest = after;
                break;
            }
        }
    }
    cleaned.push_str(rest);

    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn build_config(cli: &Cli) -> Result<RuntimeConfig, String> {
    let max_iterations = NonZeroU32::new(cli.max_iterations)
        .ok_or_else(|| "--max-iterations must be at least 1".to_string())?;
    let mut config = RuntimeConfig::new(&cli.model, max_iterations).with_memory(MemoryConfig {
        load_keys: cli.load_memory.clone(),
        save_key: cli.save_memory.clone(),
    });
    if let Some(tokens) = cli.max_tokens {
        config = config.with_max_output_tokens(tokens);
    }
    if let Some(temperature) = cli.temperature {
        config = config.with_temperature(temperature);
    }
    if let Some(secs) = cli.session_timeout {
        config = config.with_session_timeout(Duration::from_secs(secs));
    }
    if cli.summarize {
        config = config.with_summarization(Toggle::enabled(SummarizerConfig::default()));
    }
    if let Some(ref path) = cli.config {
        let file = ConfigFile::load(path).map_err(|e| e.to_string())?;
        config = file.apply(config).map_err(|e| e.to_string())?;
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(logging::level_for_verbosity(cli.verbose));

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let api_key = std::env::var("OPENROUTER_KEY")
        .map_err(|_| "OPENROUTER_KEY environment variable not set".to_string())?;
    let instruction = load_instruction(&cli)?;
    let user_content = build_user_content(&cli)?;
    let config = build_config(&cli)?;
    let tools = match cli.tools {
        Some(ref path) => load_tools(path)?,
        None => ToolRegistry::new(),
    };

    let endpoint = Arc::new(OpenRouterClient::new(api_key).map_err(|e| e.to_string())?);
    let mut runtime = AgentRuntime::new(endpoint, config).with_event_handler(Arc::new(LoggingHandler));
    if let Some(ref dir) = cli.memory_dir {
        runtime = runtime.with_memory_store(Arc::new(FileMemoryStore::new(dir)));
    }

    let session = runtime
        .start_session(instruction, Arc::new(tools))
        .await
        .map_err(|e| format!("{} ({})", e, e.code()))?;

    let ctrl_c = {
        let runtime = runtime.clone();
        let session = session.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nInterrupted; stopping at the next safe point...");
                runtime.cancel(&session);
            }
        })
    };

    let result = runtime.run(&session, user_content).await;
    ctrl_c.abort();
    let report = runtime.end_session(session).await;
    eprintln!("  {}", report.cost.summary());

    match result {
        Ok(outcome) => {
            println!("{}", outcome.answer);
            if outcome.length_limited {
                eprintln!("  (answer truncated at the output token limit)");
            }
            Ok(())
        }
        Err(e) => Err(format!("{} ({})", e, e.code())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn render_substitutes_and_drops_unfilled() {
        let cmd = render_command(
            "du -sh {{path}} {{flags}} | head -n {{n}}",
            &json!({"path": "/tmp", "n": 5}),
        );
        assert_eq!(cmd, "du -sh /tmp | head -n 5");
    }

    #[test]
    fn render_keeps_unterminated_braces() {
        assert_eq!(render_command("echo {{oops", &json!({})), "echo {{oops");
    }
}
