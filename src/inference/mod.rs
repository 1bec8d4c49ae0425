//! Inference: the model backend behind a single `generate(messages) -> text`
//! contract.
//!
//! - `client`: `ModelBackend` trait, HTTP backends, single-slot gate
//! - `config`: the `llm:` configuration section
//! - `types`: chat wire types shared with the agent core
//! - `errors`: `BackendError`

pub mod client;
pub mod config;
pub mod errors;
pub mod types;

// Re-exports for convenience
pub use client::{GatedBackend, HttpBackend, ModelBackend};
pub use config::{BackendKind, LlmConfig};
pub use errors::BackendError;
pub use types::{ChatMessage, Role};
