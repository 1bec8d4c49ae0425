//! Agent Core: the tool-augmented conversation loop and its supports.
//!
//! Submodules:
//! - `tokens`: Token Budgeter (counting and suffix-preserving trims)
//! - `database`: SQLite persistence for conversation transcripts
//! - `store`: Conversation Store with per-identity locking
//! - `dispatcher`: Tool Dispatcher and the `PlainReply | ToolCall` split
//! - `prompt`: Prompt Assembler (system preamble + budgeted history)
//! - `conversation_loop`: the bounded model/tool cycle for one turn
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod conversation_loop;
pub mod database;
pub mod dispatcher;
pub mod errors;
pub mod prompt;
pub mod store;
pub mod tokens;
pub mod types;

// Re-exports for convenience
pub use conversation_loop::{ConversationLoop, LoopSettings, TurnOutcome, TurnStatus};
pub use database::HistoryDatabase;
pub use dispatcher::{Dispatch, ModelOutput, ToolDispatcher, ToolExecution, ToolInvocation};
pub use errors::AgentError;
pub use prompt::PromptAssembler;
pub use store::{ConversationHandle, ConversationStore};
pub use tokens::TokenBudgeter;
pub use types::{ContextBudget, StoredMessage};
