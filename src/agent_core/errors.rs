//! Agent Core error types.

use thiserror::Error;

/// Errors that can occur during agent core operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A message was offered with a role outside system/user/assistant/tool.
    #[error("invalid role: '{role}'")]
    InvalidRole { role: String },

    /// The store failed to durably write or read.
    #[error("persistence error: {reason}")]
    PersistenceError { reason: String },

    /// Budget or loop settings are inconsistent.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::PersistenceError {
            reason: e.to_string(),
        }
    }
}
