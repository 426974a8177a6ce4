//! Core tool abstractions: the [`Tool`] trait, [`ToolRegistry`], and
//! [`FnTool`].
//!
//! A tool is a closed contract (name, input schema, execute) with an open set
//! of implementations. The registry is the lookup table the dispatcher reads;
//! it compiles every schema once at registration and is immutable after
//! construction, so it can be shared across sessions as `Arc<ToolRegistry>`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace};

use crate::ToolDef;
use crate::context::truncate::truncate_text;
use crate::error::ToolError;

/// Maximum size (in bytes) for tool output before truncation.
pub const DEFAULT_MAX_RESULT_BYTES: usize = 30_000;

/// Default timeout for tool execution (60 seconds).
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Boxed future returned by [`Tool::execute`].
///
/// `Ok` is the tool's output. `Err` is a failure message the model will see
/// behind a `[ToolExecutionFailed]` marker.
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>>;

// ── Tool trait ─────────────────────────────────────────────────────

/// A capability the model can call.
///
/// Implementors provide:
/// - A definition ([`Tool::definition`]) with the tool's name, description,
///   and JSON Schema for its input.
/// - An async [`Tool::execute`] that receives input already validated
///   against that schema.
///
/// # Example
///
/// ```ignore
/// struct Clock;
///
/// impl Tool for Clock {
///     fn definition(&self) -> ToolDef {
///         ToolDef::new("clock", "Current UTC time", json!({"type": "object"}))
///     }
///
///     fn execute(&self, _input: serde_json::Value) -> ToolFuture<'_> {
///         Box::pin(async { Ok(chrono::Utc::now().to_rfc3339()) })
///     }
/// }
/// ```
pub trait Tool: Send + Sync {
    /// The tool definition advertised to the model.
    fn definition(&self) -> ToolDef;

    /// Execute the tool with schema-valid input.
    ///
    /// Uses a boxed future so that the trait is dyn-compatible (object-safe).
    fn execute(&self, input: serde_json::Value) -> ToolFuture<'_>;

    /// The tool's name (convenience — delegates to definition).
    fn name(&self) -> String {
        self.definition().function.name.clone()
    }

    /// Per-tool timeout. `None` uses the dispatcher default.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

// ── ToolRegistry ───────────────────────────────────────────────────

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    definition: ToolDef,
    validator: jsonschema::Validator,
}

/// Immutable lookup table of tools by name.
///
/// # Example
///
/// ```ignore
/// let registry = ToolRegistry::new()
///     .with(lookup_tool())?
///     .with_if(allow_writes, write_tool())?;
/// let registry = Arc::new(registry);
/// ```
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = self.names();
        names.sort_unstable();
        f.debug_struct("ToolRegistry")
            .field("tools", &names)
            .finish()
    }
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Its input schema is compiled now; an invalid schema
    /// or a name already in use is rejected.
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), ToolError> {
        let definition = tool.definition();
        let name = definition.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ToolError::DuplicateName(name));
        }
        let validator = jsonschema::validator_for(&definition.function.parameters).map_err(
            |e| ToolError::InvalidSchema {
                name: name.clone(),
                reason: e.to_string(),
            },
        )?;
        debug!("[tools] registered '{name}'");
        self.tools.insert(
            name,
            RegisteredTool {
                tool: Arc::new(tool),
                definition,
                validator,
            },
        );
        Ok(())
    }

    /// Register a tool (builder pattern).
    pub fn with(mut self, tool: impl Tool + 'static) -> Result<Self, ToolError> {
        self.register(tool)?;
        Ok(self)
    }

    /// Conditionally register a tool (builder pattern).
    pub fn with_if(self, condition: bool, tool: impl Tool + 'static) -> Result<Self, ToolError> {
        if condition { self.with(tool) } else { Ok(self) }
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|t| Arc::clone(&t.tool))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Definitions for the model, sorted by name so requests are stable.
    pub fn definitions(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self.tools.values().map(|t| t.definition.clone()).collect();
        defs.sort_by(|a, b| a.name().cmp(b.name()));
        defs
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Validate input against a tool's schema. Returns one line per
    /// violation, or an empty list when the input is valid.
    ///
    /// Unknown tool names validate as empty; callers check existence first.
    pub fn validate(&self, name: &str, input: &serde_json::Value) -> Vec<String> {
        let Some(entry) = self.tools.get(name) else {
            return Vec::new();
        };
        entry
            .validator
            .iter_errors(input)
            .map(|e| {
                let path = e.instance_path().to_string();
                let path = if path.is_empty() { "/".to_string() } else { path };
                format!("{path}: {e}")
            })
            .collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ── FnTool ─────────────────────────────────────────────────────────

/// Type-erased async handler for [`FnTool`].
type ErasedToolHandler = Box<
    dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send>>
        + Send
        + Sync,
>;

/// A tool backed by an async closure over typed arguments.
///
/// # Example
///
/// ```ignore
/// #[derive(Deserialize, JsonSchema)]
/// struct LookupArgs { term: String }
///
/// let tool = FnTool::new(
///     ToolDef::new("lookup", "Define a term", json_schema_for::<LookupArgs>()),
///     |args: LookupArgs| async move { Ok(format!("{} means ...", args.term)) },
/// );
/// ```
pub struct FnTool {
    def: ToolDef,
    handler: ErasedToolHandler,
    timeout: Option<Duration>,
}

impl FnTool {
    /// Create a new closure-based tool.
    ///
    /// The handler receives arguments of type `A` deserialized from the
    /// validated input. A deserialization failure is reported to the model as
    /// an execution failure.
    pub fn new<A, F, Fut>(def: ToolDef, handler: F) -> Self
    where
        A: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        let erased = move |raw: serde_json::Value| -> Pin<
            Box<dyn Future<Output = Result<String, String>> + Send>,
        > {
            match serde_json::from_value::<A>(raw) {
                Ok(args) => Box::pin(handler(args)),
                Err(e) => {
                    let msg = format!("invalid tool arguments: {e}");
                    Box::pin(async move { Err(msg) })
                }
            }
        };

        Self {
            def,
            handler: Box::new(erased),
            timeout: None,
        }
    }

    /// Override the dispatcher's timeout for this tool (builder pattern).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Tool for FnTool {
    fn definition(&self) -> ToolDef {
        self.def.clone()
    }

    fn execute(&self, input: serde_json::Value) -> ToolFuture<'_> {
        (self.handler)(input)
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.def.function.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Log a tool call at INFO level with a truncated preview of arguments.
pub fn log_tool_call(name: &str, arguments: &str) {
    let args_preview: String = arguments.chars().take(120).collect();
    info!(
        "[tool] {}({args_preview}{})",
        name,
        if arguments.chars().count() > 120 { "..." } else { "" }
    );
    debug!("[tool] {name} full args ({} bytes)", arguments.len());
    trace!("[tool] {name} arguments: {arguments}");
}

/// Truncate a tool result to at most `max` bytes, appending a notice if
/// trimmed.
pub fn truncate_result(s: String, max: usize) -> String {
    match truncate_text(&s, max) {
        std::borrow::Cow::Borrowed(_) => s,
        std::borrow::Cow::Owned(cut) => cut,
    }
}
