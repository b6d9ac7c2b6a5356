//! Streamed response generation and fragment parsing.
//!
//! The model is asked to separate spoken phrases with `/` and to finish with
//! an out-of-band `<expr_id>_<label>|<action_id>_<label>` marker. The
//! [`ResponseStream`] turns the raw token stream into phrase fragments as
//! they complete, then one final expression/action record parsed from
//! whatever trails the last phrase.

use std::sync::Arc;

use tracing::{info, warn};

use super::prompts::Prompts;
use super::{find_split_boundary, ChatBackend, ChatMessage, TokenStream};
use crate::config::LlmConfig;
use crate::error::Result;

/// Expression id table, fixed at build time.
pub const ID2EXPRESSION: [&str; 9] = [
    "normal",
    "joy",
    "impressed",
    "convinced",
    "thinking",
    "sleepy",
    "sad",
    "surprise",
    "angry",
];

/// Action id table, fixed at build time.
pub const ID2ACTION: [&str; 9] = [
    "wait",
    "listening",
    "nod",
    "head_tilt",
    "thinking",
    "greeting",
    "strong_nod",
    "light_nod",
    "deep_breath",
];

/// The neutral expression emitted when the model supplies none.
pub const DEFAULT_EXPRESSION: &str = ID2EXPRESSION[0];
/// The neutral action emitted when the model supplies none.
pub const DEFAULT_ACTION: &str = ID2ACTION[0];

/// One parsed piece of a streamed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// A complete spoken phrase.
    Phrase(String),
    /// The end-of-stream expression/action record.
    ExpressionAction {
        /// Expression name from [`ID2EXPRESSION`].
        expression: String,
        /// Action name from [`ID2ACTION`].
        action: String,
    },
}

/// Parse a trailing marker like `1_joy|6_strong_nod` into expression and
/// action names. Unparseable ids fall back to the neutral defaults.
pub fn parse_expression_action(marker: &str) -> (String, String) {
    let mut expression = DEFAULT_EXPRESSION.to_owned();
    let mut action = DEFAULT_ACTION.to_owned();

    if let Some((expr_part, act_part)) = marker.split_once('|') {
        expression = lookup(expr_part, &ID2EXPRESSION);
        action = lookup(act_part, &ID2ACTION);
    }

    (expression, action)
}

fn lookup(part: &str, table: &[&str]) -> String {
    let id = part
        .trim()
        .split('_')
        .next()
        .and_then(|digits| digits.parse::<usize>().ok())
        .unwrap_or(0);
    table.get(id).copied().unwrap_or(table[0]).to_owned()
}

/// A lazy, cancellable sequence of response fragments.
///
/// Dropping the stream releases the underlying token stream and discards
/// any buffered fragments.
pub struct ResponseStream {
    tokens: TokenStream,
    fragment: String,
    split_characters: String,
    exhausted: bool,
    finished: bool,
    failed: bool,
}

impl ResponseStream {
    fn new(tokens: TokenStream, split_characters: String) -> Self {
        Self {
            tokens,
            fragment: String::new(),
            split_characters,
            exhausted: false,
            finished: false,
            failed: false,
        }
    }

    /// Whether the stream ended because the provider failed mid-response.
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Next fragment: phrases as they complete, then exactly one
    /// expression/action record, then `None`.
    pub async fn next(&mut self) -> Option<Fragment> {
        if self.finished {
            return None;
        }

        while !self.exhausted {
            let delta = match self.tokens.next().await {
                Some(Ok(delta)) => delta,
                Some(Err(e)) => {
                    warn!("response stream failed: {e}");
                    self.failed = true;
                    self.exhausted = true;
                    break;
                }
                None => {
                    self.exhausted = true;
                    break;
                }
            };

            let is_marker = delta.trim() == "/";
            if !is_marker {
                self.fragment.push_str(&delta);
            }

            // Flush at configured punctuation.
            if let Some(pos) = find_split_boundary(&self.fragment, &self.split_characters) {
                let head = self.fragment[..=pos].to_owned();
                self.fragment = self.fragment[pos + 1..].to_owned();
                if !head.trim().is_empty() {
                    return Some(Fragment::Phrase(head));
                }
            }

            // Flush the whole pending fragment at a `/` phrase marker.
            if is_marker && !self.fragment.trim().is_empty() {
                return Some(Fragment::Phrase(std::mem::take(&mut self.fragment)));
            }
        }

        // End of stream: whatever trails the last phrase is the
        // expression/action marker.
        self.finished = true;
        let marker = std::mem::take(&mut self.fragment);
        let (expression, action) = parse_expression_action(marker.trim());
        Some(Fragment::ExpressionAction { expression, action })
    }
}

/// A speculative response tied to the freshest user IU it saw.
pub struct ResponseAttempt {
    /// Timestamp of the ASR IU that triggered this attempt.
    pub asr_timestamp: f64,
    /// User text as of that point; `None` for self-initiated turns.
    pub user_utterance: Option<String>,
    /// The live fragment stream.
    pub stream: ResponseStream,
}

/// Builds chat contexts and opens response streams.
pub struct ResponseGenerator {
    backend: Arc<dyn ChatBackend>,
    config: LlmConfig,
    prompts: Prompts,
}

impl ResponseGenerator {
    /// Create a generator over the given backend.
    pub fn new(backend: Arc<dyn ChatBackend>, config: LlmConfig, prompts: Prompts) -> Self {
        Self {
            backend,
            config,
            prompts,
        }
    }

    /// Start a streaming response attempt.
    ///
    /// With a user utterance the context is the trailing history, the
    /// response prompt, and the utterance; without one the self-initiated
    /// turn prompt is used instead.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the stream cannot be opened.
    pub async fn generate(
        &self,
        asr_timestamp: f64,
        user_utterance: Option<String>,
        history: &[ChatMessage],
    ) -> Result<ResponseAttempt> {
        let mut messages = Vec::new();
        let skip = history
            .len()
            .saturating_sub(self.config.max_message_num_in_context);
        messages.extend_from_slice(&history[skip..]);

        match &user_utterance {
            Some(query) => {
                messages.push(ChatMessage::new("user", self.prompts.response.clone()));
                messages.push(ChatMessage::new("system", "OK"));
                messages.push(ChatMessage::new("user", query.clone()));
                info!("starting response attempt for: {query}");
            }
            None => {
                messages.push(ChatMessage::new("user", self.prompts.take_turn.clone()));
                info!("starting self-initiated response attempt");
            }
        }

        let tokens = self
            .backend
            .stream_chat(
                &self.config.response_generation_model,
                &messages,
                self.config.max_tokens,
            )
            .await?;

        Ok(ResponseAttempt {
            asr_timestamp,
            user_utterance,
            stream: ResponseStream::new(tokens, self.config.split_characters.clone()),
        })
    }
}
