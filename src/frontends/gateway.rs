//! Chat gateway: routes platform messages to per-conversation turns.
//!
//! The transport is abstract. A platform adapter (or the JSON-lines bridge
//! in [`run_json_lines`]) feeds [`InboundMessage`]s in and ships the
//! resulting [`OutboundMessage`]s back. Each conversation identity gets its
//! own worker task fed by a FIFO queue, so messages for one identity are
//! answered in arrival order while different identities proceed in parallel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::agent_core::ConversationLoop;
use crate::config::GatewayConfig;

/// Platform message size limit.
pub const MAX_MESSAGE_CHARS: usize = 2000;

const CLEAR_COMMAND: &str = "clear memory";
const CLEARED_REPLY: &str = "Conversation history for this chat has been cleared.";
const EMPTY_LLM_REPLY: &str = "(Empty response from LLM)";
const MEMORY_FAILURE_REPLY: &str = "Sorry, I couldn't access the memory for this conversation.";

// ─── Wire types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub author_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub is_direct: bool,
    #[serde(default)]
    pub mentions_bot: bool,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel_id: String,
    /// Author of the message being answered.
    pub reply_to_author: String,
    pub content: String,
}

// ─── Routing ────────────────────────────────────────────────────────────────

/// A message the gateway will answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub identity: String,
    /// Content with bot mentions removed and whitespace trimmed.
    pub content: String,
}

/// Decides which messages get answered and under which identity.
#[derive(Debug, Clone)]
pub struct Router {
    bot_user_id: String,
    allowed_channels: HashSet<String>,
}

impl Router {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            bot_user_id: config.bot_user_id.clone(),
            allowed_channels: config
                .allowed_channel_ids
                .iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
        }
    }

    fn mention_tags(&self) -> [String; 2] {
        [
            format!("<@{}>", self.bot_user_id),
            format!("<@!{}>", self.bot_user_id),
        ]
    }

    fn is_mentioned(&self, msg: &InboundMessage) -> bool {
        msg.mentions_bot
            || self
                .mention_tags()
                .iter()
                .any(|tag| msg.content.contains(tag.as_str()))
    }

    fn channel_allowed(&self, channel_id: &str) -> bool {
        self.allowed_channels.is_empty() || self.allowed_channels.contains(channel_id)
    }

    /// `None` when the message should be ignored.
    pub fn route(&self, msg: &InboundMessage) -> Option<Accepted> {
        if msg.author_id == self.bot_user_id {
            return None;
        }

        let mentioned = self.is_mentioned(msg);
        if !(msg.is_direct || (mentioned && self.channel_allowed(&msg.channel_id))) {
            return None;
        }

        let mut content = msg.content.clone();
        for tag in self.mention_tags() {
            content = content.replace(&tag, "");
        }
        let content = content.trim().to_string();
        if content.is_empty() {
            tracing::debug!(author = %msg.author_id, "ignoring empty message after mention removal");
            return None;
        }

        Some(Accepted {
            identity: conversation_identity(msg),
            content,
        })
    }
}

/// `dm:<author>` for direct messages, `channel:<channel>` otherwise.
pub fn conversation_identity(msg: &InboundMessage) -> String {
    if msg.is_direct {
        format!("dm:{}", msg.author_id)
    } else {
        format!("channel:{}", msg.channel_id)
    }
}

/// Split `text` into chunks of at most `max_chars` characters.
///
/// Breaks fall on line boundaries; a single line longer than the limit is
/// cut hard.
pub fn split_reply(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars || max_chars == 0 {
        return vec![text.to_string()];
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len <= max_chars {
            current.push_str(line);
            current_len += line_len;
            continue;
        }

        if !current.is_empty() {
            parts.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len > max_chars {
            let chars: Vec<char> = line.chars().collect();
            parts.extend(chars.chunks(max_chars).map(|c| c.iter().collect::<String>()));
        } else {
            current.push_str(line);
            current_len = line_len;
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

// ─── Gateway ────────────────────────────────────────────────────────────────

pub struct Gateway {
    chat: Arc<ConversationLoop>,
    router: Router,
    preamble: String,
}

impl Gateway {
    pub fn new(chat: Arc<ConversationLoop>, config: &GatewayConfig, preamble: impl Into<String>) -> Self {
        Self {
            chat,
            router: Router::new(config),
            preamble: preamble.into(),
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Handle one routed message to its replies.
    pub async fn respond(&self, msg: &InboundMessage, accepted: Accepted) -> Vec<OutboundMessage> {
        let Accepted { identity, content } = accepted;
        tracing::info!(
            identity = %identity,
            author = %msg.author_id,
            preview = %content.chars().take(50).collect::<String>(),
            "gateway message accepted"
        );

        let text = if content.eq_ignore_ascii_case(CLEAR_COMMAND) {
            match self.chat.clear(&identity).await {
                Ok(removed) => {
                    tracing::info!(identity = %identity, removed, "conversation cleared");
                    CLEARED_REPLY.to_string()
                }
                Err(e) => {
                    tracing::error!(identity = %identity, error = %e, "clear failed");
                    MEMORY_FAILURE_REPLY.to_string()
                }
            }
        } else {
            match self.chat.handle_turn(&identity, &self.preamble, &content).await {
                Ok(outcome) if outcome.reply.trim().is_empty() => EMPTY_LLM_REPLY.to_string(),
                Ok(outcome) => outcome.reply,
                Err(e) => {
                    tracing::error!(identity = %identity, error = %e, "gateway turn failed");
                    MEMORY_FAILURE_REPLY.to_string()
                }
            }
        };

        let parts = split_reply(&text, MAX_MESSAGE_CHARS);
        if parts.len() > 1 {
            tracing::info!(parts = parts.len(), "reply split for the message size limit");
        }
        parts
            .into_iter()
            .map(|content| OutboundMessage {
                channel_id: msg.channel_id.clone(),
                reply_to_author: msg.author_id.clone(),
                content,
            })
            .collect()
    }

    /// Route and answer one message. Ignored messages produce nothing.
    pub async fn handle(&self, msg: InboundMessage) -> Vec<OutboundMessage> {
        match self.router.route(&msg) {
            Some(accepted) => self.respond(&msg, accepted).await,
            None => Vec::new(),
        }
    }

    /// Answer every message from `inbound`, one worker per identity.
    ///
    /// Returns after the input ends and every queued turn has finished.
    pub async fn serve(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<InboundMessage>,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
    ) {
        let mut tasks = JoinSet::new();
        let mut queues: HashMap<String, mpsc::UnboundedSender<(InboundMessage, Accepted)>> =
            HashMap::new();

        while let Some(msg) = inbound.recv().await {
            while let Some(done) = tasks.try_join_next() {
                log_task_result(done);
            }

            let Some(accepted) = self.router.route(&msg) else {
                continue;
            };
            let identity = accepted.identity.clone();
            let mut job = (msg, accepted);
            if let Some(queue) = queues.get(&identity) {
                match queue.send(job) {
                    Ok(()) => continue,
                    // Worker gone (it panicked); start a fresh one.
                    Err(mpsc::error::SendError(returned)) => job = returned,
                }
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(job);
            queues.insert(identity, tx);
            tasks.spawn(identity_worker(Arc::clone(&self), rx, outbound.clone()));
        }

        drop(queues);
        while let Some(done) = tasks.join_next().await {
            log_task_result(done);
        }
    }
}

/// Answer one identity's messages in order until its queue closes.
async fn identity_worker(
    gateway: Arc<Gateway>,
    mut queue: mpsc::UnboundedReceiver<(InboundMessage, Accepted)>,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
) {
    while let Some((msg, accepted)) = queue.recv().await {
        for reply in gateway.respond(&msg, accepted).await {
            if outbound.send(reply).is_err() {
                tracing::warn!("outbound channel closed; dropping reply");
                break;
            }
        }
    }
}

fn log_task_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::error!(error = %e, "gateway task failed");
    }
}

// ─── JSON-lines bridge ──────────────────────────────────────────────────────

/// Bridge a line-delimited JSON stream: one [`InboundMessage`] per input
/// line, one [`OutboundMessage`] per output line.
pub async fn run_json_lines<R, W>(
    gateway: Arc<Gateway>,
    input: R,
    mut output: W,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (in_tx, in_rx) = mpsc::channel::<InboundMessage>(64);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundMessage>();

    let reader = async move {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<InboundMessage>(&line) {
                Ok(msg) => {
                    if in_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "skipping malformed inbound line"),
            }
        }
        Ok::<(), std::io::Error>(())
    };

    let writer = async move {
        while let Some(msg) = out_rx.recv().await {
            let mut line = serde_json::to_string(&msg)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            line.push('\n');
            output.write_all(line.as_bytes()).await?;
            output.flush().await?;
        }
        Ok::<(), std::io::Error>(())
    };

    let (read_result, (), write_result) =
        tokio::join!(reader, gateway.serve(in_rx, out_tx), writer);
    read_result?;
    write_result
}

// ─── Tests ──────────────────────────────────────────────────────────────────
