//! Tools the model can request, and the registry they live in.
//!
//! The registry is assembled once at startup from [`ToolsConfig`] and then
//! shared read-only (behind an `Arc`) by the dispatcher and the front-ends.
//!
//! - `builtin`: date/time, location, and the simulated lookup
//! - `shell`: `execute_shell_command` and config-driven CLI wrappers
//! - `rest`: config-driven REST lookups
//! - `image`: config-driven image generation and image search
//! - `config`: the `tools:` configuration section

pub mod builtin;
pub mod config;
pub mod image;
pub mod rest;
pub mod shell;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

pub use config::{CliToolConfig, ImageToolConfig, RestToolConfig, ToolsConfig};

/// Timeout for tools that don't set their own.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Errors ─────────────────────────────────────────────────────────────────

/// Failure raised by a single tool call. Never fatal to a conversation.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Required arguments missing or of the wrong shape.
    #[error("{reason}")]
    InvalidArguments { reason: String },

    /// The tool ran and failed.
    #[error("{reason}")]
    ExecutionFailed { reason: String },

    /// The tool did not finish within its own timeout.
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },
}

/// Failure while assembling the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate tool name: '{name}'")]
    DuplicateName { name: String },

    #[error("invalid tool '{name}': {reason}")]
    InvalidTool { name: String, reason: String },
}

// ─── Tool Trait ─────────────────────────────────────────────────────────────

/// One named argument a tool accepts. All arguments are strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolParam {
    pub name: String,
    pub description: String,
}

impl ToolParam {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// A capability the model may invoke by name.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Named arguments, in documentation order. Empty for no-arg tools.
    fn parameters(&self) -> &[ToolParam] {
        &[]
    }

    fn timeout(&self) -> Duration {
        DEFAULT_TOOL_TIMEOUT
    }

    /// Run the tool. Unknown extra arguments are ignored.
    async fn call(&self, args: &Map<String, Value>) -> Result<String, ToolError>;
}

/// Fetch a required string argument. Numbers and booleans are accepted in
/// their JSON text form.
pub fn required_arg(args: &Map<String, Value>, name: &str) -> Result<String, ToolError> {
    match args.get(name) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Bool(b)) => Ok(b.to_string()),
        Some(Value::String(_)) => Err(ToolError::InvalidArguments {
            reason: format!("argument '{name}' must not be empty"),
        }),
        Some(other) => Err(ToolError::InvalidArguments {
            reason: format!("argument '{name}' must be a string, got {other}"),
        }),
        None => Err(ToolError::InvalidArguments {
            reason: format!("missing required argument '{name}'"),
        }),
    }
}

/// Run `tool` on its own task, bounded by the tool's timeout.
///
/// A panic inside the tool comes back as `ExecutionFailed`; on timeout the
/// task is aborted.
pub async fn call_with_timeout(
    tool: Arc<dyn Tool>,
    args: Map<String, Value>,
) -> Result<String, ToolError> {
    let limit = tool.timeout();
    let mut handle = tokio::spawn(async move { tool.call(&args).await });

    match tokio::time::timeout(limit, &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) if join_err.is_panic() => Err(ToolError::ExecutionFailed {
            reason: "the tool panicked".into(),
        }),
        Ok(Err(join_err)) => Err(ToolError::ExecutionFailed {
            reason: format!("tool task failed: {join_err}"),
        }),
        Err(_) => {
            handle.abort();
            Err(ToolError::Timeout {
                secs: limit.as_secs(),
            })
        }
    }
}

// ─── ToolRegistry ───────────────────────────────────────────────────────────

/// Read-only mapping from tool name to implementation.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    /// Build the registry described by the `tools:` section.
    ///
    /// Built-ins are always present; the shell tool only with `allow_shell`.
    pub fn from_config(config: &ToolsConfig) -> Result<Self, RegistryError> {
        let mut builder = Self::builder();
        builder.register(builtin::DateTimeTool)?;
        builder.register(builtin::LocationTool::new(&config.location))?;
        builder.register(builtin::OsintSearchTool::new(&config.location))?;

        if config.allow_shell {
            tracing::warn!("execute_shell_command is enabled; the model can run arbitrary commands");
            builder.register(shell::ShellTool::default())?;
        }
        for cli in &config.cli {
            builder.register(shell::CliTool::from_config(cli)?)?;
        }
        for rest in &config.rest {
            builder.register(rest::RestTool::from_config(rest)?)?;
        }
        for img in &config.image {
            builder.register(image::ImageTool::from_config(img)?)?;
        }

        let registry = builder.build();
        tracing::info!(count = registry.len(), tools = ?registry.names(), "tool registry built");
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|k| k.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool documentation appended to the system preamble: each tool's
    /// signature and description, then the exact call format.
    pub fn describe(&self) -> String {
        let mut out =
            String::from("You have access to the following tools to gather information or perform actions:\n");

        for tool in self.tools.values() {
            let params = tool.parameters();
            let signature = params
                .iter()
                .map(|p| format!("{}: str", p.name))
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!("\n- {}({}):\n", tool.name(), signature));
            out.push_str(&format!("    Description: {}\n", tool.description()));
            if params.is_empty() {
                out.push_str("    Arguments: None.\n");
            } else {
                out.push_str("    Arguments:\n");
                for p in params {
                    out.push_str(&format!("      - {} (str): {}\n", p.name, p.description));
                }
            }
        }

        out.push_str(CALL_FORMAT_DOC);
        out
    }

    /// Run a tool by name with `arg` bound to its first parameter.
    ///
    /// Used by the console `!tool` command. `None` if the tool is unknown.
    pub async fn invoke_direct(
        &self,
        name: &str,
        arg: &str,
    ) -> Option<Result<String, ToolError>> {
        let tool = self.get(name)?;
        let mut args = Map::new();
        if let Some(first) = tool.parameters().first() {
            args.insert(first.name.clone(), Value::String(arg.to_string()));
        }
        tracing::info!(tool = %name, "direct tool invocation");
        Some(call_with_timeout(tool, args).await)
    }
}

const CALL_FORMAT_DOC: &str = r#"
**How to Use Tools:**
When you decide to use a tool, respond *only* with a single JSON object in the following format. Do not include any other text before or after the JSON object.
```json
{
  "tool_name": "<name_of_the_tool_to_use>",
  "arguments": {
    "<argument_name_1>": "<value1>",
    "<argument_name_2>": "<value2>"
  }
}
```
If a tool takes no arguments, provide an empty "arguments" object: `"arguments": {}`.
If you can answer the user's query without using a tool, respond directly in plain text.
"#;

/// Collects tools before freezing them into a [`ToolRegistry`].
#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistryBuilder {
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<&mut Self, RegistryError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<&mut Self, RegistryError> {
        let name = tool.name().to_string();
        if name.trim().is_empty() {
            return Err(RegistryError::InvalidTool {
                name,
                reason: "tool name is empty".into(),
            });
        }
        if self.tools.contains_key(&name) {
            return Err(RegistryError::DuplicateName { name });
        }
        self.tools.insert(name, tool);
        Ok(self)
    }

    pub fn build(self) -> ToolRegistry {
        ToolRegistry { tools: self.tools }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
