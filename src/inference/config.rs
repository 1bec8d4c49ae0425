//! Model backend configuration (the `llm:` section of the app config).
//!
//! Holds the runtime selector, endpoint, sampling parameters, the hard
//! generation timeout and the context window numbers the prompt assembler
//! budgets against.

use serde::Deserialize;

use super::errors::BackendError;

/// Which HTTP dialect the model runtime speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Ollama native `/api/chat`.
    Ollama,
    /// llama.cpp `llama-server` or any OpenAI-compatible `/v1/chat/completions`.
    #[serde(alias = "openai")]
    LlamaCpp,
}

impl BackendKind {
    fn default_host(self) -> &'static str {
        match self {
            BackendKind::Ollama => "http://localhost:11434",
            BackendKind::LlamaCpp => "http://localhost:8080",
        }
    }
}

/// Model runtime configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(rename = "type", default = "default_kind")]
    pub kind: BackendKind,
    /// Endpoint root, e.g. `http://localhost:11434`. Defaults per runtime.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Generation cap sent to the runtime.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Hard ceiling on a single generation. Exceeding it is a backend failure.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Total model context size in tokens.
    #[serde(default = "default_context_limit")]
    pub context_limit: u32,
    /// Tokens held back for the model's own reply.
    #[serde(default = "default_reserved_for_response")]
    pub reserved_for_response: u32,
}

fn default_kind() -> BackendKind {
    BackendKind::Ollama
}
fn default_model_name() -> String {
    "llama3".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_context_limit() -> u32 {
    4096
}
fn default_reserved_for_response() -> u32 {
    1024
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            host: None,
            model_name: default_model_name(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            context_limit: default_context_limit(),
            reserved_for_response: default_reserved_for_response(),
        }
    }
}

impl LlmConfig {
    /// Endpoint root without a trailing slash.
    pub fn base_url(&self) -> String {
        self.host
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| self.kind.default_host())
            .trim_end_matches('/')
            .to_string()
    }

    /// `context_limit - reserved_for_response`.
    ///
    /// A reservation larger than the window is rejected, never clamped.
    pub fn usable_tokens(&self) -> Result<u32, BackendError> {
        self.context_limit
            .checked_sub(self.reserved_for_response)
            .ok_or_else(|| BackendError::ConfigError {
                reason: format!(
                    "reserved_for_response ({}) exceeds context_limit ({})",
                    self.reserved_for_response, self.context_limit
                ),
            })
    }

    pub fn validate(&self) -> Result<(), BackendError> {
        self.usable_tokens()?;
        if self.model_name.trim().is_empty() {
            return Err(BackendError::ConfigError {
                reason: "llm.model_name must not be empty".into(),
            });
        }
        if self.timeout_secs == 0 {
            return Err(BackendError::ConfigError {
                reason: "llm.timeout_secs must be positive".into(),
            });
        }
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let cfg: LlmConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.kind, BackendKind::Ollama);
        assert_eq!(cfg.base_url(), "http://localhost:11434");
        assert_eq!(cfg.usable_tokens().unwrap(), 3072);
    }

    #[test]
    fn test_llama_cpp_host_trailing_slash_trimmed() {
        let yaml = r#"
            type: llama_cpp
            host: "http://127.0.0.1:9000/"
        "#;
        let cfg: LlmConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.kind, BackendKind::LlamaCpp);
        assert_eq!(cfg.base_url(), "http://127.0.0.1:9000");
    }

    #[test]
    fn test_reservation_equal_to_limit_is_zero_budget() {
        let cfg = LlmConfig {
            context_limit: 512,
            reserved_for_response: 512,
            ..LlmConfig::default()
        };
        assert_eq!(cfg.usable_tokens().unwrap(), 0);
    }

    #[test]
    fn test_reservation_above_limit_is_config_error() {
        let cfg = LlmConfig {
            context_limit: 512,
            reserved_for_response: 1024,
            ..LlmConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, BackendError::ConfigError { .. }));
        assert!(err.to_string().contains("exceeds context_limit"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let cfg = LlmConfig {
            timeout_secs: 0,
            ..LlmConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
