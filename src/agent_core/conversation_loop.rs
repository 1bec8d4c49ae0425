//! Conversation Loop: drives one user turn through the bounded
//! model → tool → model cycle.
//!
//! A turn holds its identity's store lock from the user append to the final
//! reply, so a second message for the same conversation waits for the first
//! to finish. Other identities run in parallel; the model backend serialises
//! generations on its own gate.
//!
//! Round structure:
//! 1. Assemble the prompt from the history as it stands.
//! 2. Generate. A backend failure ends the turn with a generic reply.
//! 3. Plain reply: store it as `assistant` and finish.
//!    Tool call: store the raw call as `assistant`, the result as `tool`,
//!    and go round again.
//!
//! After `max_tool_iterations` tool rounds one more generation runs and its
//! output is the reply, whatever it contains.

use std::sync::Arc;
use std::time::Instant;

use tracing::Instrument;

use super::dispatcher::{ModelOutput, ToolDispatcher, ToolOutcome};
use super::errors::AgentError;
use super::prompt::PromptAssembler;
use super::store::{ConversationHandle, ConversationStore};
use crate::inference::client::ModelBackend;
use crate::inference::types::Role;
use crate::tools::ToolRegistry;

/// Reply shown when generation fails mid-turn.
pub const BACKEND_FAILURE_REPLY: &str = "Sorry, I encountered an error generating a response.";

/// Reply shown when the forced final generation fails.
pub const TOOL_LIMIT_FAILURE_REPLY: &str =
    "Sorry, I reached the tool limit and couldn't generate a final response.";

/// Placeholder for an empty model reply.
pub const EMPTY_REPLY_PLACEHOLDER: &str = "(empty response)";

pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 3;

// ─── Types ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    /// The model answered in plain text.
    Completed,
    /// Tool rounds ran out; the forced final generation is the reply.
    CompletedAfterToolLimit,
    /// A generation failed; `reply` is a generic apology and nothing was
    /// stored for the failed call.
    BackendFailed,
}

/// What one turn produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub reply: String,
    /// Tools executed this turn, in order.
    pub tools_used: Vec<String>,
    pub model_calls: usize,
    pub status: TurnStatus,
}

impl TurnOutcome {
    /// Reply text for display; an empty reply shows a placeholder.
    pub fn display_text(&self) -> &str {
        if self.reply.trim().is_empty() {
            EMPTY_REPLY_PLACEHOLDER
        } else {
            &self.reply
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub max_tool_iterations: usize,
    pub tools_enabled: bool,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
            tools_enabled: false,
        }
    }
}

// ─── ConversationLoop ───────────────────────────────────────────────────────

pub struct ConversationLoop {
    store: Arc<ConversationStore>,
    backend: Arc<dyn ModelBackend>,
    dispatcher: ToolDispatcher,
    assembler: PromptAssembler,
    settings: LoopSettings,
}

impl ConversationLoop {
    pub fn new(
        store: Arc<ConversationStore>,
        backend: Arc<dyn ModelBackend>,
        dispatcher: ToolDispatcher,
        assembler: PromptAssembler,
        settings: LoopSettings,
    ) -> Result<Self, AgentError> {
        if settings.max_tool_iterations == 0 {
            return Err(AgentError::ConfigError {
                reason: "max_tool_iterations must be at least 1".into(),
            });
        }
        Ok(Self {
            store,
            backend,
            dispatcher,
            assembler,
            settings,
        })
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn registry(&self) -> &ToolRegistry {
        self.dispatcher.registry()
    }

    pub fn tools_enabled(&self) -> bool {
        self.settings.tools_enabled
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    /// Empty the history for `identity`, waiting for any running turn.
    pub async fn clear(&self, identity: &str) -> Result<usize, AgentError> {
        self.store.clear(identity).await
    }

    /// Process one user message to a final reply.
    ///
    /// Backend failures and tool failures are part of the outcome. `Err` is
    /// reserved for store failures; the history then holds exactly the
    /// messages appended before the failure.
    pub async fn handle_turn(
        &self,
        identity: &str,
        preamble: &str,
        user_text: &str,
    ) -> Result<TurnOutcome, AgentError> {
        let turn_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("turn", identity = %identity, turn_id = %turn_id);
        self.run_turn(identity, preamble, user_text)
            .instrument(span)
            .await
    }

    async fn run_turn(
        &self,
        identity: &str,
        preamble: &str,
        user_text: &str,
    ) -> Result<TurnOutcome, AgentError> {
        let start = Instant::now();
        let conversation = self.store.lock(identity).await?;
        conversation.append(Role::User, user_text)?;

        let mut tools_used: Vec<String> = Vec::new();
        let mut model_calls = 0usize;

        for round in 0..self.settings.max_tool_iterations {
            let (messages, budget) =
                self.assembler
                    .build(&conversation, preamble, self.settings.tools_enabled)?;

            tracing::info!(
                round,
                message_count = messages.len(),
                system_tokens = budget.system_prompt,
                history_tokens = budget.history,
                dropped_messages = budget.dropped_messages,
                "=== TOOL LOOP ROUND START ==="
            );

            model_calls += 1;
            let text = match self.backend.generate(&messages).await {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(round, error = %e, kind = e.kind(), "generation failed; ending turn");
                    return Ok(TurnOutcome {
                        reply: BACKEND_FAILURE_REPLY.to_string(),
                        tools_used,
                        model_calls,
                        status: TurnStatus::BackendFailed,
                    });
                }
            };

            let output = if self.settings.tools_enabled {
                ModelOutput::parse(&text)
            } else {
                ModelOutput::PlainReply(text.clone())
            };

            match output {
                ModelOutput::PlainReply(_) => {
                    conversation.append(Role::Assistant, &text)?;
                    tracing::info!(
                        round,
                        reply_chars = text.chars().count(),
                        tools_used = tools_used.len(),
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "turn completed"
                    );
                    return Ok(TurnOutcome {
                        reply: text,
                        tools_used,
                        model_calls,
                        status: TurnStatus::Completed,
                    });
                }
                ModelOutput::ToolCall(invocation) => {
                    let execution = self.dispatcher.execute(&invocation).await;
                    if execution.outcome != ToolOutcome::Succeeded {
                        tracing::warn!(
                            round,
                            tool = %execution.tool_name,
                            outcome = ?execution.outcome,
                            "tool call did not succeed; result goes back to the model"
                        );
                    }
                    conversation.append(Role::Assistant, &text)?;
                    conversation.append(Role::Tool, &execution.result)?;
                    tools_used.push(execution.tool_name);
                }
            }
        }

        self.forced_final_reply(&conversation, preamble, tools_used, model_calls, start)
            .await
    }

    /// One last generation after the tool budget is spent. Tool docs are left
    /// out of the prompt and the output is taken as the reply regardless.
    async fn forced_final_reply(
        &self,
        conversation: &ConversationHandle<'_>,
        preamble: &str,
        tools_used: Vec<String>,
        mut model_calls: usize,
        start: Instant,
    ) -> Result<TurnOutcome, AgentError> {
        tracing::warn!(
            max_tool_iterations = self.settings.max_tool_iterations,
            "tool iteration limit reached; forcing final reply"
        );

        let (messages, _) = self.assembler.build(conversation, preamble, false)?;
        model_calls += 1;

        match self.backend.generate(&messages).await {
            Ok(text) => {
                conversation.append(Role::Assistant, &text)?;
                tracing::info!(
                    tools_used = tools_used.len(),
                    model_calls,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "turn completed after tool limit"
                );
                Ok(TurnOutcome {
                    reply: text,
                    tools_used,
                    model_calls,
                    status: TurnStatus::CompletedAfterToolLimit,
                })
            }
            Err(e) => {
                tracing::error!(error = %e, kind = e.kind(), "final generation failed");
                Ok(TurnOutcome {
                    reply: TOOL_LIMIT_FAILURE_REPLY.to_string(),
                    tools_used,
                    model_calls,
                    status: TurnStatus::BackendFailed,
                })
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
