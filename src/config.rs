//! Application configuration, loaded from YAML.
//!
//! `${VAR}` and `${VAR:-default}` are interpolated from the environment
//! before parsing; a leading `~` in a default expands to the home directory.
//! Every section is optional and a missing file yields the defaults.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::agent_core::conversation_loop::DEFAULT_MAX_TOOL_ITERATIONS;
use crate::inference::config::LlmConfig;
use crate::tools::ToolsConfig;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

// ─── Sections ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryConfig {
    /// SQLite file. Relative paths resolve against the config file's
    /// directory; unset means `<data_dir>/memory.db`.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
    #[serde(default = "default_console_preamble")]
    pub console_preamble: String,
    #[serde(default = "default_gateway_preamble")]
    pub gateway_preamble: String,
}

fn default_max_tool_iterations() -> usize {
    DEFAULT_MAX_TOOL_ITERATIONS
}
fn default_console_preamble() -> String {
    "You are a helpful offline assistant.".to_string()
}
fn default_gateway_preamble() -> String {
    "You are a helpful chat assistant.".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: default_max_tool_iterations(),
            console_preamble: default_console_preamble(),
            gateway_preamble: default_gateway_preamble(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub enabled: bool,
    /// The bot's own user id; its messages are ignored and `<@id>` mentions
    /// of it are stripped.
    #[serde(default)]
    pub bot_user_id: String,
    /// Channels where mentions are answered. Empty means all channels.
    #[serde(default)]
    pub allowed_channel_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Log directory; defaults to the data directory.
    #[serde(default)]
    pub dir: Option<String>,
    /// Emit JSON lines instead of plain text.
    #[serde(default)]
    pub json: bool,
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// A loaded config and where it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: AppConfig,
    /// `None` when the file was missing and defaults were used.
    pub source: Option<PathBuf>,
}

impl LoadedConfig {
    /// Directory relative paths in the config resolve against.
    pub fn base_dir(&self) -> Option<&Path> {
        self.source.as_deref().and_then(Path::parent)
    }
}

/// Load `path`, falling back to defaults if it does not exist.
pub fn load_config(path: &Path) -> Result<LoadedConfig, ConfigError> {
    if !path.exists() {
        return Ok(LoadedConfig {
            config: AppConfig::default(),
            source: None,
        });
    }

    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let config = parse_config(&raw, &path.display().to_string())?;
    Ok(LoadedConfig {
        config,
        source: Some(path.to_path_buf()),
    })
}

/// Interpolate and parse YAML text. `origin` names the source in errors.
pub fn parse_config(raw: &str, origin: &str) -> Result<AppConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);
    if interpolated.trim().is_empty() {
        return Ok(AppConfig::default());
    }
    serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
        path: origin.to_string(),
        reason: e.to_string(),
    })
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.llm.validate().map_err(|e| ConfigError::Invalid {
            reason: e.to_string(),
        })?;

        if self.agent.max_tool_iterations == 0 {
            return Err(ConfigError::Invalid {
                reason: "agent.max_tool_iterations must be at least 1".into(),
            });
        }

        let mut seen = HashSet::new();
        for name in self.tools.declared_names() {
            if !seen.insert(name) {
                return Err(ConfigError::Invalid {
                    reason: format!("duplicate tool name: '{name}'"),
                });
            }
        }

        if self.gateway.enabled && self.gateway.bot_user_id.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: "gateway.bot_user_id is required when the gateway is enabled".into(),
            });
        }
        Ok(())
    }

    /// History database location.
    pub fn memory_path(&self, base_dir: Option<&Path>, data_dir: &Path) -> PathBuf {
        match self.memory.path.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(p) => resolve_relative(&expand_tilde(p), base_dir),
            None => data_dir.join("memory.db"),
        }
    }

    /// Log directory.
    pub fn log_dir(&self, base_dir: Option<&Path>, data_dir: &Path) -> PathBuf {
        match self.logging.dir.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(p) => resolve_relative(&expand_tilde(p), base_dir),
            None => data_dir.to_path_buf(),
        }
    }
}

fn resolve_relative(path: &str, base_dir: Option<&Path>) -> PathBuf {
    let p = PathBuf::from(path);
    match base_dir {
        Some(base) if p.is_relative() => base.join(p),
        _ => p,
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
pub(crate) fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                var_expr.push(c);
            }
            if closed {
                result.push_str(&resolve_var_expr(&var_expr));
            } else {
                // Unterminated: keep the text as written.
                result.push_str("${");
                result.push_str(&var_expr);
            }
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::config::BackendKind;

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__TOOLCHAT_NONEXISTENT_VAR__");
        let result = interpolate_env_vars("${__TOOLCHAT_NONEXISTENT_VAR__:-/fallback/path}");
        assert_eq!(result, "/fallback/path");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__TOOLCHAT_CONFIG_VAR__", "/custom/path");
        let result = interpolate_env_vars("dir: ${__TOOLCHAT_CONFIG_VAR__:-/fallback/path}");
        assert_eq!(result, "dir: /custom/path");
        std::env::remove_var("__TOOLCHAT_CONFIG_VAR__");
    }

    #[test]
    fn test_interpolate_unterminated_kept() {
        assert_eq!(interpolate_env_vars("cost: ${oops"), "cost: ${oops");
        assert_eq!(interpolate_env_vars("plain $HOME text"), "plain $HOME text");
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/Documents");
        assert!(!result.starts_with('~'), "tilde should be expanded");
        assert!(result.ends_with("/Documents"));
    }

    #[test]
    fn test_empty_yaml_gives_defaults() {
        let cfg = parse_config("", "test").unwrap();
        assert_eq!(cfg.agent.max_tool_iterations, 3);
        assert_eq!(cfg.agent.console_preamble, "You are a helpful offline assistant.");
        assert!(!cfg.tools.enabled);
        assert!(!cfg.gateway.enabled);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_full_yaml() {
        let yaml = r#"
llm:
  type: llama_cpp
  model_name: mistral
  context_limit: 8192
  reserved_for_response: 2048
memory:
  path: data/memory.db
agent:
  max_tool_iterations: 5
tools:
  enabled: true
  location: "Lisbon, Portugal"
  cli:
    - name: nmap_scan
      description: Scan a host.
      program: nmap
      args: "-A {arg}"
      timeout_secs: 600
gateway:
  enabled: true
  bot_user_id: "42"
  allowed_channel_ids: ["100", "200"]
"#;
        let cfg = parse_config(yaml, "test").unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.llm.kind, BackendKind::LlamaCpp);
        assert_eq!(cfg.llm.usable_tokens().unwrap(), 6144);
        assert_eq!(cfg.agent.max_tool_iterations, 5);
        assert_eq!(cfg.tools.cli[0].timeout_secs, 600);
        assert_eq!(cfg.gateway.allowed_channel_ids, vec!["100", "200"]);

        let base = Path::new("/etc/toolchat");
        assert_eq!(
            cfg.memory_path(Some(base), Path::new("/data")),
            PathBuf::from("/etc/toolchat/data/memory.db")
        );
    }

    #[test]
    fn test_memory_path_defaults_to_data_dir() {
        let cfg = AppConfig::default();
        assert_eq!(
            cfg.memory_path(None, Path::new("/data")),
            PathBuf::from("/data/memory.db")
        );
    }

    #[test]
    fn test_reservation_above_limit_invalid() {
        let cfg = parse_config(
            "llm:\n  context_limit: 512\n  reserved_for_response: 1024\n",
            "test",
        )
        .unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_zero_iterations_invalid() {
        let cfg = parse_config("agent:\n  max_tool_iterations: 0\n", "test").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_duplicate_tool_names_invalid() {
        let yaml = r#"
tools:
  rest:
    - name: get_current_datetime
      description: clash
      url: https://example.com
"#;
        let cfg = parse_config(yaml, "test").unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate tool name"));
    }

    #[test]
    fn test_gateway_requires_bot_id() {
        let cfg = parse_config("gateway:\n  enabled: true\n", "test").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_malformed_yaml_is_parse_error() {
        let err = parse_config("llm: [unclosed", "bad.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { ref path, .. } if path == "bad.yaml"));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_config(&dir.path().join("absent.yaml")).unwrap();
        assert!(loaded.source.is_none());
        assert_eq!(loaded.config.agent.max_tool_iterations, 3);
    }

    #[test]
    fn test_load_file_sets_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "tools:\n  enabled: true\n").unwrap();
        let loaded = load_config(&path).unwrap();
        assert!(loaded.config.tools.enabled);
        assert_eq!(loaded.base_dir(), Some(dir.path()));
    }
}
