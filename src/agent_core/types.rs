//! Shared types for the agent core.

use serde::{Deserialize, Serialize};

use crate::inference::types::{ChatMessage, Role};

// ─── Conversation Messages ──────────────────────────────────────────────────

/// A single message stored in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Auto-incremented row ID; strictly increasing in insertion order.
    pub id: i64,
    /// Conversation identity this message belongs to.
    pub identity: String,
    /// RFC 3339 timestamp (UTC).
    pub timestamp: String,
    /// system, user, assistant, or tool.
    pub role: Role,
    /// Text content. May be empty, never null.
    pub content: String,
    /// Token count at insert time.
    pub token_count: u32,
}

impl StoredMessage {
    pub fn to_chat(&self) -> ChatMessage {
        ChatMessage::new(self.role, self.content.clone())
    }
}

// ─── Context Budget ─────────────────────────────────────────────────────────

/// How an assembled prompt spends the model's context window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBudget {
    /// Total model context size.
    pub total: u32,
    /// Tokens held back for the reply.
    pub reserved_for_response: u32,
    /// `total - reserved_for_response`.
    pub usable: u32,
    /// Tokens spent on the system message (0 if the history already has one).
    pub system_prompt: u32,
    /// Tokens spent on history after trimming.
    pub history: u32,
    /// History messages that did not fit, in whole or in part.
    pub dropped_messages: usize,
}

impl ContextBudget {
    /// Usable tokens not yet spent.
    pub fn remaining(&self) -> u32 {
        self.usable
            .saturating_sub(self.system_prompt)
            .saturating_sub(self.history)
    }
}
