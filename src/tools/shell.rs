//! Subprocess tools.
//!
//! `execute_shell_command` hands its argument to `sh -c` and is only
//! registered when `tools.allow_shell` is set. [`CliTool`] wraps a single
//! external program from configuration and never goes through a shell.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::process::Command;

use super::config::CliToolConfig;
use super::{required_arg, RegistryError, Tool, ToolError, ToolParam};
use crate::agent_core::tokens::cap_with_marker;

const SHELL_TIMEOUT: Duration = Duration::from_secs(15);
const SHELL_MAX_OUTPUT_CHARS: usize = 1500;
const SHELL_TRUNCATION_MARKER: &str = "\n... (output truncated)";
const CLI_TRUNCATION_MARKER: &str = "\n... (truncated)";
const ARG_PLACEHOLDER: &str = "{arg}";

// ─── execute_shell_command ──────────────────────────────────────────────────

pub struct ShellTool {
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl Default for ShellTool {
    fn default() -> Self {
        Self {
            working_dir: dirs::home_dir(),
            timeout: SHELL_TIMEOUT,
        }
    }
}

impl ShellTool {
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

fn shell_params() -> &'static [ToolParam] {
    static PARAMS: OnceLock<Vec<ToolParam>> = OnceLock::new();
    PARAMS.get_or_init(|| {
        vec![ToolParam::new(
            "command",
            "The shell command to execute (e.g., \"ls -l /tmp\").",
        )]
    })
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "execute_shell_command"
    }

    fn description(&self) -> &str {
        "Executes a shell command on the host system. Only use for simple, safe, read-only \
         commands (e.g., 'ls', 'pwd') when the user explicitly asks for one."
    }

    fn parameters(&self) -> &[ToolParam] {
        shell_params()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn call(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let command = required_arg(args, "command")?;
        tracing::warn!(command = %command, "executing shell command");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await.map_err(|e| ToolError::ExecutionFailed {
            reason: format!("failed to start shell: {e}"),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code().unwrap_or(-1);

        let mut result = format!("Exit Code: {code}\n");
        if !stdout.trim().is_empty() {
            result.push_str(&format!("STDOUT:\n{}\n", stdout.trim()));
        }
        if !stderr.trim().is_empty() {
            result.push_str(&format!("STDERR:\n{}", stderr.trim()));
        }

        let capped = cap_with_marker(&result, SHELL_MAX_OUTPUT_CHARS, SHELL_TRUNCATION_MARKER);
        Ok(capped.trim().to_string())
    }
}

// ─── CLI wrappers ───────────────────────────────────────────────────────────

/// A configured external program, e.g. `nmap -A {arg}`.
#[derive(Debug)]
pub struct CliTool {
    name: String,
    description: String,
    program: String,
    template: Vec<String>,
    params: Vec<ToolParam>,
    timeout: Duration,
    max_output_chars: usize,
}

impl CliTool {
    pub fn from_config(config: &CliToolConfig) -> Result<Self, RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidTool {
            name: config.name.clone(),
            reason: reason.to_string(),
        };
        if config.program.trim().is_empty() {
            return Err(invalid("program must not be empty"));
        }
        if config.timeout_secs == 0 {
            return Err(invalid("timeout_secs must be positive"));
        }
        if config.max_output_chars == 0 {
            return Err(invalid("max_output_chars must be positive"));
        }

        let template: Vec<String> = config.args.split_whitespace().map(String::from).collect();
        let params = if template.iter().any(|t| t.contains(ARG_PLACEHOLDER)) {
            vec![ToolParam::new("arg", "Target or input passed to the program.")]
        } else {
            Vec::new()
        };

        Ok(Self {
            name: config.name.clone(),
            description: config.description.clone(),
            program: config.program.clone(),
            template,
            params,
            timeout: Duration::from_secs(config.timeout_secs),
            max_output_chars: config.max_output_chars,
        })
    }

    /// `<NAME>_BIN` with the tool name upper-cased, e.g. `NMAP_SCAN_BIN`.
    fn override_var(&self) -> String {
        let upper: String = self
            .name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{upper}_BIN")
    }

    fn resolve_program(&self) -> String {
        std::env::var(self.override_var())
            .ok()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.program.clone())
    }

    fn build_argv(&self, arg: Option<&str>) -> Vec<String> {
        self.template
            .iter()
            .map(|token| match arg {
                Some(a) => token.replace(ARG_PLACEHOLDER, a),
                None => token.clone(),
            })
            .collect()
    }

    fn fail(&self, reason: impl std::fmt::Display) -> ToolError {
        ToolError::ExecutionFailed {
            reason: format!("[{}] {reason}", self.name),
        }
    }
}

#[async_trait]
impl Tool for CliTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &[ToolParam] {
        &self.params
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn call(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let arg = if self.params.is_empty() {
            None
        } else {
            Some(required_arg(args, "arg")?)
        };
        let program = self.resolve_program();
        let argv = self.build_argv(arg.as_deref());
        tracing::info!(tool = %self.name, program = %program, args = ?argv, "running cli tool");

        let output = Command::new(&program)
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.fail(format!("failed to start '{program}': {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(self.fail(format!(
                "exit code {code}: {}",
                cap_with_marker(&detail, self.max_output_chars, CLI_TRUNCATION_MARKER)
            )));
        }

        Ok(cap_with_marker(
            stdout.trim(),
            self.max_output_chars,
            CLI_TRUNCATION_MARKER,
        ))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
