//! Prompt Assembler: builds the message list sent to the model.
//!
//! The system preamble (plus tool documentation when tools are enabled) is
//! reserved whole. A system message already stored in the history replaces
//! the preamble and is pinned first the same way. Stored history fills what is left of the usable budget,
//! newest first; the oldest message that only partly fits keeps its tail.

use super::errors::AgentError;
use super::store::ConversationHandle;
use super::tokens::{TokenBudgeter, MESSAGE_OVERHEAD_TOKENS};
use super::types::ContextBudget;
use crate::inference::types::{ChatMessage, Role};
use crate::tools::ToolRegistry;

#[derive(Debug, Clone)]
pub struct PromptAssembler {
    budgeter: TokenBudgeter,
    context_limit: u32,
    reserved_for_response: u32,
    usable: u32,
    tool_docs: String,
}

impl PromptAssembler {
    /// Fails with `ConfigError` when the reservation exceeds the window.
    pub fn new(
        budgeter: TokenBudgeter,
        context_limit: u32,
        reserved_for_response: u32,
        registry: &ToolRegistry,
    ) -> Result<Self, AgentError> {
        let usable = context_limit
            .checked_sub(reserved_for_response)
            .ok_or_else(|| AgentError::ConfigError {
                reason: format!(
                    "reserved_for_response ({reserved_for_response}) exceeds context_limit ({context_limit})"
                ),
            })?;

        Ok(Self {
            budgeter,
            context_limit,
            reserved_for_response,
            usable,
            tool_docs: registry.describe(),
        })
    }

    /// `context_limit - reserved_for_response`.
    pub fn usable_tokens(&self) -> u32 {
        self.usable
    }

    /// The system message text for `preamble`.
    pub fn system_prompt(&self, preamble: &str, tools_enabled: bool) -> String {
        if tools_enabled {
            format!("{}\n\n{}", preamble.trim_end(), self.tool_docs)
        } else {
            preamble.to_string()
        }
    }

    /// Assemble the prompt for the conversation behind `conversation`.
    pub fn build(
        &self,
        conversation: &ConversationHandle<'_>,
        preamble: &str,
        tools_enabled: bool,
    ) -> Result<(Vec<ChatMessage>, ContextBudget), AgentError> {
        let history = conversation.read(None)?;
        let history: Vec<ChatMessage> = history.iter().map(|m| m.to_chat()).collect();
        Ok(self.assemble(&history, preamble, tools_enabled))
    }

    /// Budget `history` behind a system message.
    ///
    /// The first stored system message, if any, stands in for the preamble.
    /// Either way the system message is charged first and never trimmed.
    pub fn assemble(
        &self,
        history: &[ChatMessage],
        preamble: &str,
        tools_enabled: bool,
    ) -> (Vec<ChatMessage>, ContextBudget) {
        let pinned = history.iter().position(|m| m.role == Role::System);
        let system = match pinned {
            Some(idx) => history[idx].clone(),
            None => ChatMessage::system(self.system_prompt(preamble, tools_enabled)),
        };
        let history: Vec<&ChatMessage> = history
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != pinned)
            .map(|(_, m)| m)
            .collect();

        let system_tokens = self.budgeter.message_tokens(&system);
        if system_tokens > self.usable {
            tracing::warn!(
                system_tokens,
                usable = self.usable,
                "system prompt alone exceeds the usable budget"
            );
        }

        let mut remaining = self.usable.saturating_sub(system_tokens);
        let mut kept: Vec<ChatMessage> = Vec::new();
        let mut history_tokens = 0u32;
        let mut whole = 0usize;

        for message in history.iter().rev() {
            let cost = self.budgeter.message_tokens(message);
            if cost <= remaining {
                remaining -= cost;
                history_tokens += cost;
                whole += 1;
                kept.push((*message).clone());
                continue;
            }

            if remaining > MESSAGE_OVERHEAD_TOKENS {
                let tail = self
                    .budgeter
                    .trim(&message.content, remaining - MESSAGE_OVERHEAD_TOKENS);
                if !tail.is_empty() {
                    let partial = ChatMessage::new(message.role, tail);
                    history_tokens += self.budgeter.message_tokens(&partial);
                    kept.push(partial);
                }
            }
            break;
        }
        kept.reverse();
        let dropped_messages = history.len() - whole;

        if dropped_messages > 0 {
            tracing::info!(
                dropped_messages,
                kept = kept.len(),
                history_tokens,
                "history trimmed to fit the context budget"
            );
        }

        let mut messages = Vec::with_capacity(kept.len() + 1);
        messages.push(system);
        messages.extend(kept);

        let budget = ContextBudget {
            total: self.context_limit,
            reserved_for_response: self.reserved_for_response,
            usable: self.usable,
            system_prompt: system_tokens,
            history: history_tokens,
            dropped_messages,
        };
        (messages, budget)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
