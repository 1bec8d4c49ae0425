//! Model backend client.
//!
//! One contract, [`ModelBackend::generate`], turns an ordered message list
//! into reply text or a [`BackendError`]. [`HttpBackend`] implements it for
//! Ollama and OpenAI-compatible runtimes; [`GatedBackend`] wraps any backend
//! with a process-wide single-slot gate and a hard timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use tokio::sync::Semaphore;

use super::config::{BackendKind, LlmConfig};
use super::errors::BackendError;
use super::types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, OllamaChatRequest,
    OllamaChatResponse, OllamaOptions,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Stop sequences for llama.cpp chat templates that leak turn markers.
const LLAMA_STOP_SEQUENCES: &[&str] = &["\nUser:", "</s>", "<|im_end|>"];

// ─── Contract ────────────────────────────────────────────────────────────────

/// Text generation from a structured message history.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Generate a reply for `messages`. Never retries internally.
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, BackendError>;

    /// Model identifier for logs and the console banner.
    fn model_name(&self) -> &str;
}

// ─── HttpBackend ─────────────────────────────────────────────────────────────

/// HTTP client for a locally hosted model runtime.
pub struct HttpBackend {
    http: HttpClient,
    kind: BackendKind,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout_secs: u64,
}

impl HttpBackend {
    /// Build from the `llm:` config section. Does not check connectivity.
    pub fn from_config(config: &LlmConfig) -> Result<Self, BackendError> {
        config.validate()?;
        let base_url = config.base_url();

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BackendError::ConfigError {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            kind: config.kind,
            base_url,
            model: config.model_name.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout_secs: config.timeout_secs,
        })
    }

    fn endpoint(&self) -> String {
        match self.kind {
            BackendKind::Ollama => format!("{}/api/chat", self.base_url),
            BackendKind::LlamaCpp => format!("{}/v1/chat/completions", self.base_url),
        }
    }

    async fn post_json<B: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<String, BackendError> {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(url, e, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(BackendError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        response
            .text()
            .await
            .map_err(|e| BackendError::InvalidResponse {
                reason: format!("failed to read response body: {e}"),
            })
    }

    async fn generate_openai(
        &self,
        url: &str,
        messages: &[ChatMessage],
    ) -> Result<String, BackendError> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: false,
            stop: LLAMA_STOP_SEQUENCES,
        };
        let raw = self.post_json(url, &body).await?;
        parse_completion_body(&raw)
    }

    async fn generate_ollama(
        &self,
        url: &str,
        messages: &[ChatMessage],
    ) -> Result<String, BackendError> {
        let body = OllamaChatRequest {
            model: &self.model,
            messages,
            stream: false,
            options: OllamaOptions {
                temperature: self.temperature,
                num_predict: self.max_tokens,
            },
        };
        let raw = self.post_json(url, &body).await?;
        parse_ollama_body(&raw)
    }
}

#[async_trait]
impl ModelBackend for HttpBackend {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, BackendError> {
        let url = self.endpoint();

        // Request metadata only; the body can be large.
        tracing::info!(
            url = %url,
            model = %self.model,
            message_count = messages.len(),
            max_tokens = self.max_tokens,
            "=== MODEL REQUEST ==="
        );

        let started = Instant::now();
        let result = match self.kind {
            BackendKind::Ollama => self.generate_ollama(&url, messages).await,
            BackendKind::LlamaCpp => self.generate_openai(&url, messages).await,
        };

        match &result {
            Ok(text) => tracing::info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                reply_chars = text.chars().count(),
                "model reply received"
            ),
            Err(e) => tracing::warn!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                kind = e.kind(),
                error = %e,
                "model request failed"
            ),
        }
        result
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Extract reply text from an OpenAI-style completion body.
fn parse_completion_body(body: &str) -> Result<String, BackendError> {
    let resp: ChatCompletionResponse =
        serde_json::from_str(body).map_err(|e| BackendError::InvalidResponse {
            reason: format!("failed to parse completion: {e}"),
        })?;

    if let Some(usage) = &resp.usage {
        tracing::debug!(
            prompt_tokens = ?usage.prompt_tokens,
            completion_tokens = ?usage.completion_tokens,
            "completion usage"
        );
    }

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| BackendError::InvalidResponse {
            reason: "empty choices array".into(),
        })?;
    Ok(choice.message.content.unwrap_or_default().trim().to_string())
}

/// Extract reply text from an Ollama `/api/chat` body.
fn parse_ollama_body(body: &str) -> Result<String, BackendError> {
    let resp: OllamaChatResponse =
        serde_json::from_str(body).map_err(|e| BackendError::InvalidResponse {
            reason: format!("failed to parse ollama reply: {e}"),
        })?;
    tracing::debug!(
        prompt_tokens = ?resp.prompt_eval_count,
        completion_tokens = ?resp.eval_count,
        "ollama usage"
    );
    Ok(resp.message.content.trim().to_string())
}

// ─── GatedBackend ────────────────────────────────────────────────────────────

/// Serializes access to a shared backend and bounds each generation.
///
/// Generation runs on its own spawned task so a slow model never blocks the
/// caller's executor thread. Only one generation is in flight process-wide;
/// further callers queue on the gate. Queue time does not count toward the
/// timeout.
pub struct GatedBackend {
    inner: Arc<dyn ModelBackend>,
    gate: Arc<Semaphore>,
    timeout: Duration,
}

impl GatedBackend {
    pub fn new(inner: Arc<dyn ModelBackend>, timeout: Duration) -> Self {
        Self {
            inner,
            gate: Arc::new(Semaphore::new(1)),
            timeout,
        }
    }
}

#[async_trait]
impl ModelBackend for GatedBackend {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, BackendError> {
        let permit = Arc::clone(&self.gate)
            .acquire_owned()
            .await
            .map_err(|e| BackendError::Unavailable {
                reason: format!("generation gate closed: {e}"),
            })?;

        let inner = Arc::clone(&self.inner);
        let owned = messages.to_vec();
        let mut handle = tokio::spawn(async move {
            let _permit = permit;
            inner.generate(&owned).await
        });

        match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(BackendError::Unavailable {
                reason: format!("generation task failed: {join_err}"),
            }),
            Err(_) => {
                // Aborting drops the task's permit and frees the gate.
                handle.abort();
                tracing::error!(
                    timeout_secs = self.timeout.as_secs(),
                    "model generation timed out"
                );
                Err(BackendError::Timeout {
                    duration_secs: self.timeout.as_secs(),
                })
            }
        }
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
