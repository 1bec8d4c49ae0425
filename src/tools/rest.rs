//! REST lookup tools built from configuration (IP info, geolocation and the
//! like). Each issues one GET and returns the JSON body pretty-printed.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client as HttpClient, Url};
use serde_json::{Map, Value};

use super::config::RestToolConfig;
use super::{required_arg, RegistryError, Tool, ToolError, ToolParam};
use crate::agent_core::tokens::cap_with_marker;
use crate::config::interpolate_env_vars;

const MAX_OUTPUT_CHARS: usize = 4000;
const TRUNCATION_MARKER: &str = "\n... (truncated)";
/// Error bodies quoted back to the model are kept short.
const ERROR_BODY_CHARS: usize = 300;

pub struct RestTool {
    name: String,
    description: String,
    base: Url,
    query_param: Option<String>,
    headers: HeaderMap,
    timeout: Duration,
    http: HttpClient,
}

fn rest_params() -> &'static [ToolParam] {
    static PARAMS: OnceLock<Vec<ToolParam>> = OnceLock::new();
    PARAMS.get_or_init(|| vec![ToolParam::new("arg", "Value to look up (e.g. an IP address).")])
}

impl RestTool {
    pub fn from_config(config: &RestToolConfig) -> Result<Self, RegistryError> {
        let invalid = |reason: String| RegistryError::InvalidTool {
            name: config.name.clone(),
            reason,
        };

        let base = Url::parse(config.url.trim())
            .map_err(|e| invalid(format!("bad url '{}': {e}", config.url)))?;
        if base.cannot_be_a_base() {
            return Err(invalid(format!("url '{}' cannot take a path", config.url)));
        }
        if config.timeout_secs == 0 {
            return Err(invalid("timeout_secs must be positive".into()));
        }

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| invalid(format!("bad header name '{key}': {e}")))?;
            let value = HeaderValue::from_str(&interpolate_env_vars(value))
                .map_err(|e| invalid(format!("bad value for header '{key}': {e}")))?;
            headers.insert(name, value);
        }

        let timeout = Duration::from_secs(config.timeout_secs);
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| invalid(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            name: config.name.clone(),
            description: config.description.clone(),
            base,
            query_param: config.query_param.clone().filter(|q| !q.is_empty()),
            headers,
            timeout,
            http,
        })
    }

    /// `{url}/{arg}`, or `{url}?{query_param}={arg}`. The argument is
    /// percent-encoded either way.
    fn request_url(&self, arg: &str) -> Result<Url, ToolError> {
        let mut url = self.base.clone();
        match &self.query_param {
            Some(param) => {
                url.query_pairs_mut().append_pair(param, arg);
            }
            None => {
                let mut segments = url
                    .path_segments_mut()
                    .map_err(|_| self.fail("url cannot take a path"))?;
                segments.pop_if_empty().push(arg);
            }
        }
        Ok(url)
    }

    fn fail(&self, reason: impl std::fmt::Display) -> ToolError {
        ToolError::ExecutionFailed {
            reason: format!("[{}] {reason}", self.name),
        }
    }
}

/// Pretty-print a JSON body; anything else is returned as trimmed text.
fn format_body(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(json) => serde_json::to_string_pretty(&json).unwrap_or_else(|_| body.to_string()),
        Err(_) => body.trim().to_string(),
    }
}

#[async_trait]
impl Tool for RestTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &[ToolParam] {
        rest_params()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn call(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let arg = required_arg(args, "arg")?;
        let url = self.request_url(arg.trim())?;
        tracing::info!(tool = %self.name, url = %url, "rest lookup");

        let response = self
            .http
            .get(url)
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ToolError::Timeout {
                        secs: self.timeout.as_secs(),
                    }
                } else {
                    self.fail(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.fail(format!("failed to read body: {e}")))?;

        if !status.is_success() {
            return Err(self.fail(format!(
                "HTTP {status}: {}",
                cap_with_marker(body.trim(), ERROR_BODY_CHARS, "...")
            )));
        }

        Ok(cap_with_marker(
            &format_body(&body),
            MAX_OUTPUT_CHARS,
            TRUNCATION_MARKER,
        ))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
