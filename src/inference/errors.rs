//! Model backend error types.
//!
//! Every backend failure, whether connection, HTTP, decoding or timeout,
//! surfaces as a `BackendError`. The conversation loop treats any of them as
//! "this turn has no model reply" and never retries.

use thiserror::Error;

/// Errors returned by [`ModelBackend::generate`](super::client::ModelBackend::generate).
#[derive(Debug, Error)]
pub enum BackendError {
    /// TCP/HTTP connection to the model endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// Generation did not finish within the hard timeout.
    #[error("generation timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx HTTP response from the model endpoint.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The endpoint answered but the body was not what we expected.
    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },

    /// Backend could not be constructed from configuration.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// The generation task died before producing a result.
    #[error("backend unavailable: {reason}")]
    Unavailable { reason: String },
}

impl BackendError {
    /// Short machine-friendly kind, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::ConnectionFailed { .. } => "connection_failed",
            BackendError::Timeout { .. } => "timeout",
            BackendError::HttpError { .. } => "http_error",
            BackendError::InvalidResponse { .. } => "invalid_response",
            BackendError::ConfigError { .. } => "config_error",
            BackendError::Unavailable { .. } => "unavailable",
        }
    }

    /// Map a `reqwest` transport error against `endpoint`.
    pub(crate) fn from_reqwest(endpoint: &str, err: reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            BackendError::Timeout {
                duration_secs: timeout_secs,
            }
        } else {
            BackendError::ConnectionFailed {
                endpoint: endpoint.to_string(),
                reason: err.to_string(),
            }
        }
    }
}
