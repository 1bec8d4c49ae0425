//! Token counting and suffix-preserving trimming for context budgets.
//!
//! The default tokenizer is a deterministic lexical splitter: word pieces of
//! at most four characters (a single leading space rides along with the
//! first piece), one token per whitespace run, one token per punctuation or
//! symbol character. It over-counts relative to real BPE vocabularies, which
//! keeps assembled prompts inside the model's window.
//!
//! When a tokenizer reports itself unavailable the budgeter falls back to a
//! character-ratio approximation (~3.2 bytes/token). Trimming never fails.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::inference::types::ChatMessage;

// ─── Constants ──────────────────────────────────────────────────────────────

/// Approximation ratio expressed as integers: 16 bytes per 5 tokens (3.2).
///
/// Integer arithmetic keeps `count(trim(x, n)) <= n` exact; a float ratio
/// can round the boundary case the wrong way.
const APPROX_BYTES_NUM: usize = 16;
const APPROX_TOKENS_DEN: usize = 5;

/// Maximum alphanumeric characters per lexical word piece.
const WORD_PIECE_CHARS: usize = 4;

/// Per-message overhead (role label, formatting tokens).
pub const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

// ─── Truncation ─────────────────────────────────────────────────────────────

/// First `max_chars` Unicode scalar values of `s`.
pub(crate) fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Cap `s` at `max_chars` characters, appending `marker` when cut.
pub(crate) fn cap_with_marker(s: &str, max_chars: usize, marker: &str) -> String {
    let head = truncate_chars(s, max_chars);
    if head.len() == s.len() {
        s.to_string()
    } else {
        format!("{head}{marker}")
    }
}

// ─── Approximation ──────────────────────────────────────────────────────────

/// Approximate token count: `ceil(bytes / 3.2)`.
pub fn estimate_tokens(text: &str) -> u32 {
    let scaled = text.len() * APPROX_TOKENS_DEN;
    scaled.div_ceil(APPROX_BYTES_NUM) as u32
}

/// Longest suffix whose approximate count fits in `max_tokens`.
fn approximate_suffix(text: &str, max_tokens: u32) -> &str {
    let max_bytes = max_tokens as usize * APPROX_BYTES_NUM / APPROX_TOKENS_DEN;
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

// ─── Tokenizers ─────────────────────────────────────────────────────────────

/// A tokenizer could not process the input.
#[derive(Debug, Error)]
#[error("tokenizer unavailable: {reason}")]
pub struct TokenizerError {
    pub reason: String,
}

/// A deterministic tokenizer.
///
/// Implementations must be context-free to the left: tokenizing the suffix
/// that begins at any returned offset yields the corresponding tail of the
/// original offsets. Suffix trimming relies on this.
pub trait Tokenizer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Ascending byte offsets at which each token starts.
    fn token_starts(&self, text: &str) -> Result<Vec<usize>, TokenizerError>;
}

/// Word-piece / whitespace-run / symbol splitter.
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicalTokenizer;

impl Tokenizer for LexicalTokenizer {
    fn name(&self) -> &'static str {
        "lexical"
    }

    fn token_starts(&self, text: &str) -> Result<Vec<usize>, TokenizerError> {
        let chars: Vec<(usize, char)> = text.char_indices().collect();
        let mut starts = Vec::with_capacity(chars.len() / 3 + 1);
        let mut i = 0;

        while i < chars.len() {
            let (pos, c) = chars[i];
            if c.is_whitespace() {
                let mut j = i;
                while j < chars.len() && chars[j].1.is_whitespace() {
                    j += 1;
                }
                // A single trailing space is absorbed by the following word.
                let absorbs =
                    j < chars.len() && chars[j].1.is_alphanumeric() && chars[j - 1].1 == ' ';
                let run_end = if absorbs { j - 1 } else { j };
                if run_end > i {
                    starts.push(pos);
                }
                i = if absorbs {
                    push_word(&chars, j - 1, true, &mut starts)
                } else {
                    j
                };
            } else if c.is_alphanumeric() {
                i = push_word(&chars, i, false, &mut starts);
            } else {
                starts.push(pos);
                i += 1;
            }
        }

        Ok(starts)
    }
}

/// Emit word-piece starts for the alphanumeric run at `i`; returns the index
/// just past the run.
fn push_word(
    chars: &[(usize, char)],
    mut i: usize,
    leading_space: bool,
    starts: &mut Vec<usize>,
) -> usize {
    starts.push(chars[i].0);
    if leading_space {
        i += 1;
    }
    let mut in_piece = 0;
    while i < chars.len() && chars[i].1.is_alphanumeric() {
        if in_piece == WORD_PIECE_CHARS {
            starts.push(chars[i].0);
            in_piece = 0;
        }
        in_piece += 1;
        i += 1;
    }
    i
}

// ─── TokenBudgeter ──────────────────────────────────────────────────────────

/// Counts tokens and trims text to a budget, keeping the most recent content.
#[derive(Clone)]
pub struct TokenBudgeter {
    tokenizer: Option<Arc<dyn Tokenizer>>,
    warned: Arc<AtomicBool>,
}

impl Default for TokenBudgeter {
    fn default() -> Self {
        Self::with_tokenizer(Arc::new(LexicalTokenizer))
    }
}

impl std::fmt::Debug for TokenBudgeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBudgeter")
            .field("tokenizer", &self.tokenizer.as_ref().map(|t| t.name()))
            .finish()
    }
}

impl TokenBudgeter {
    pub fn with_tokenizer(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            tokenizer: Some(tokenizer),
            warned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Character-ratio approximation only.
    pub fn approximate() -> Self {
        Self {
            tokenizer: None,
            warned: Arc::new(AtomicBool::new(false)),
        }
    }

    fn starts(&self, text: &str) -> Option<Vec<usize>> {
        let tokenizer = self.tokenizer.as_ref()?;
        match tokenizer.token_starts(text) {
            Ok(starts) => Some(starts),
            Err(e) => {
                if !self.warned.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        tokenizer = tokenizer.name(),
                        error = %e,
                        "tokenizer unavailable, falling back to approximation"
                    );
                }
                None
            }
        }
    }

    /// Token count of `text`.
    pub fn count(&self, text: &str) -> u32 {
        match self.starts(text) {
            Some(starts) => starts.len() as u32,
            None => estimate_tokens(text),
        }
    }

    /// Tokens for one chat message including per-message overhead.
    pub fn message_tokens(&self, message: &ChatMessage) -> u32 {
        MESSAGE_OVERHEAD_TOKENS + self.count(&message.content)
    }

    /// Longest token-aligned suffix of `text` that fits in `max_tokens`.
    ///
    /// Returns `text` unchanged when it already fits.
    pub fn trim<'a>(&self, text: &'a str, max_tokens: u32) -> &'a str {
        let max = max_tokens as usize;
        if let Some(starts) = self.starts(text) {
            return suffix_by_starts(text, &starts, max);
        }

        let approx = approximate_suffix(text, max_tokens);
        // The tokenizer may cope with the shorter slice; honour its count if so.
        match self.tokenizer.as_ref().and_then(|t| t.token_starts(approx).ok()) {
            Some(starts) => suffix_by_starts(approx, &starts, max),
            None => approx,
        }
    }
}

fn suffix_by_starts<'a>(text: &'a str, starts: &[usize], max: usize) -> &'a str {
    if starts.len() <= max {
        text
    } else if max == 0 {
        ""
    } else {
        &text[starts[starts.len() - max]..]
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
