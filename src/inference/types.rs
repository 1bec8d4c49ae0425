//! Wire types for the model backends.
//!
//! `ChatMessage` and `Role` are the shared vocabulary between the conversation
//! store, the prompt assembler, and the backends. The request/response structs
//! mirror the two HTTP dialects we speak: OpenAI-compatible chat completions
//! (llama.cpp server, LM Studio, vLLM) and Ollama's native `/api/chat`.

use serde::{Deserialize, Serialize};

// ─── Messages ───────────────────────────────────────────────────────────────

/// A single `{role, content}` message sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Message role. Only these four values are ever stored or sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    /// Parse a wire name. Exact, lowercase match only.
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── OpenAI-compatible dialect ──────────────────────────────────────────────

/// Request body for `POST /v1/chat/completions`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
    #[serde(skip_serializing_if = "no_stop_sequences")]
    pub stop: &'a [&'a str],
}

fn no_stop_sequences(stop: &&[&str]) -> bool {
    stop.is_empty()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    pub choices: Vec<CompletionChoice>,
    #[serde(default)]
    pub usage: Option<CompletionUsage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionChoice {
    pub message: CompletionMessage,
    #[serde(default)]
    #[allow(dead_code)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionUsage {
    #[serde(default)]
    pub prompt_tokens: Option<u32>,
    #[serde(default)]
    pub completion_tokens: Option<u32>,
}

// ─── Ollama dialect ─────────────────────────────────────────────────────────

/// Request body for Ollama's `POST /api/chat`.
#[derive(Debug, Clone, Serialize)]
pub struct OllamaChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub stream: bool,
    pub options: OllamaOptions,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct OllamaOptions {
    pub temperature: f32,
    /// Ollama's name for `max_tokens`.
    pub num_predict: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OllamaChatResponse {
    pub message: OllamaMessage,
    #[serde(default)]
    pub prompt_eval_count: Option<u32>,
    #[serde(default)]
    pub eval_count: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OllamaMessage {
    #[serde(default)]
    pub content: String,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serializes_lowercase() {
        let msg = ChatMessage::new(Role::Tool, "42");
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"role":"tool","content":"42"}"#);
    }

    #[test]
    fn test_role_parse_accepts_only_known_roles() {
        assert_eq!(Role::parse("assistant"), Some(Role::Assistant));
        assert_eq!(Role::parse("Assistant"), None);
        assert_eq!(Role::parse("moderator"), None);
        assert_eq!(Role::parse(""), None);
    }

    #[test]
    fn test_stop_omitted_when_empty() {
        let req = ChatCompletionRequest {
            model: "m",
            messages: &[],
            temperature: 0.7,
            max_tokens: 16,
            stream: false,
            stop: &[],
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("stop"), "stop should be omitted when empty");
    }

    #[test]
    fn test_completion_response_tolerates_missing_usage() {
        let body = r#"{"choices":[{"message":{"content":"hi"},"finish_reason":"stop"}]}"#;
        let resp: ChatCompletionResponse = serde_json::from_str(body).unwrap();
        assert!(resp.usage.is_none());
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("hi"));
    }

    #[test]
    fn test_ollama_request_shape() {
        let msgs = vec![ChatMessage::user("hello")];
        let req = OllamaChatRequest {
            model: "llama3",
            messages: &msgs,
            stream: false,
            options: OllamaOptions {
                temperature: 0.5,
                num_predict: 64,
            },
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["options"]["num_predict"], 64);
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["stream"], false);
    }
}
