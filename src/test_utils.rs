//! Shared test doubles used across module tests and integration tests.
//!
//! The external collaborators (chat provider, speech recognizer, turn
//! model, synthesis engine) are all trait seams; the scripted fakes here
//! stand in for them so module behavior can be exercised deterministically
//! over the in-process bus.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{CoreError, Result};
use crate::llm::{ChatBackend, ChatMessage, TokenStream};

/// One scripted chat completion.
#[derive(Debug, Clone)]
pub enum ChatScript {
    /// Stream these deltas, then end.
    Tokens(Vec<String>),
    /// Stream these deltas, then leave the stream open forever (for
    /// mid-response barge-in paths).
    TokensThenHang(Vec<String>),
    /// Echo the last user message back as a single phrase.
    EchoUser,
    /// Fail immediately when the stream is opened.
    Fail,
    /// Stream these deltas, then fail mid-stream.
    MidStreamError(Vec<String>),
    /// Open a stream that never yields.
    Hang,
    /// Never finish opening the stream (for bounded-wait timeout paths).
    StallOpen,
}

/// Chat backend that replays scripted completions.
///
/// Scripts are consumed in order; once the queue is empty the default
/// script is replayed for every further call.
pub struct ScriptedChat {
    scripts: Mutex<VecDeque<ChatScript>>,
    default_script: ChatScript,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    /// Senders kept alive so `Hang` streams never close.
    hang_guards: Mutex<Vec<mpsc::Sender<Result<String>>>>,
    /// Delay before the first delta of each stream.
    first_token_delay: Duration,
}

impl ScriptedChat {
    /// Replay the same token list for every call.
    pub fn with_tokens(tokens: &[&str]) -> Self {
        Self::new(ChatScript::Tokens(
            tokens.iter().map(|t| (*t).to_owned()).collect(),
        ))
    }

    /// Use `default_script` once the ordered `scripts` queue is drained.
    pub fn new(default_script: ChatScript) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            default_script,
            requests: Mutex::new(Vec::new()),
            hang_guards: Mutex::new(Vec::new()),
            first_token_delay: Duration::ZERO,
        }
    }

    /// Queue a script to be consumed by the next call.
    pub fn push_script(&self, script: ChatScript) {
        self.scripts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(script);
    }

    /// Delay the first delta of every stream (simulates provider latency).
    #[must_use]
    pub fn with_first_token_delay(mut self, delay: Duration) -> Self {
        self.first_token_delay = delay;
        self
    }

    /// Number of streams opened so far.
    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// The message list of the most recent call.
    ///
    /// # Panics
    ///
    /// Panics if no call was made yet.
    pub fn last_request(&self) -> Vec<ChatMessage> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .last()
            .cloned()
            .expect("no chat request recorded")
    }
}

#[async_trait]
impl ChatBackend for ScriptedChat {
    async fn stream_chat(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        _max_tokens: u32,
    ) -> Result<TokenStream> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(messages.to_vec());

        let script = self
            .scripts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.default_script.clone());

        match script {
            ChatScript::Fail => Err(CoreError::Llm("scripted failure".to_owned())),
            ChatScript::StallOpen => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            ChatScript::Hang => {
                let (tx, rx) = mpsc::channel(1);
                self.hang_guards
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push(tx);
                Ok(TokenStream::new(rx))
            }
            ChatScript::Tokens(tokens) => {
                Ok(spawn_token_feed(tokens, None, self.first_token_delay))
            }
            ChatScript::TokensThenHang(tokens) => {
                let (tx, rx) = mpsc::channel(tokens.len().max(1) + 1);
                let guard = tx.clone();
                self.hang_guards
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push(guard);
                tokio::spawn(async move {
                    for token in tokens {
                        if tx.send(Ok(token)).await.is_err() {
                            return;
                        }
                    }
                });
                Ok(TokenStream::new(rx))
            }
            ChatScript::EchoUser => {
                let query = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == "user")
                    .map(|m| m.content.clone())
                    .unwrap_or_default();
                Ok(spawn_token_feed(
                    vec![query, "/".to_owned()],
                    None,
                    self.first_token_delay,
                ))
            }
            ChatScript::MidStreamError(tokens) => Ok(spawn_token_feed(
                tokens,
                Some(CoreError::Transport("scripted mid-stream error".to_owned())),
                self.first_token_delay,
            )),
        }
    }
}

/// Recognizer whose sessions replay scripted snapshots, one per received
/// audio chunk. Extra audio is drained so feeders never block.
pub struct ScriptedRecognizer {
    sessions: Mutex<VecDeque<Vec<crate::asr::Snapshot>>>,
    opened: std::sync::atomic::AtomicUsize,
}

impl ScriptedRecognizer {
    /// One inner `Vec` per session, consumed in order; later sessions
    /// replay nothing.
    pub fn new(sessions: Vec<Vec<crate::asr::Snapshot>>) -> Self {
        Self {
            sessions: Mutex::new(sessions.into()),
            opened: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Number of sessions opened so far.
    pub fn opened(&self) -> usize {
        self.opened.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl crate::asr::Recognizer for ScriptedRecognizer {
    async fn open_session(&self) -> Result<crate::asr::RecognizerSession> {
        self.opened
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let script = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
            .unwrap_or_default();

        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(64);
        let (snap_tx, snapshots) = mpsc::channel(16);
        tokio::spawn(async move {
            for snapshot in script {
                if audio_rx.recv().await.is_none() {
                    return;
                }
                if snap_tx.send(snapshot).await.is_err() {
                    return;
                }
            }
            // Keep draining so the adapter's feed never errors.
            while audio_rx.recv().await.is_some() {}
        });
        Ok(crate::asr::RecognizerSession {
            audio_tx,
            snapshots,
        })
    }
}

fn spawn_token_feed(
    tokens: Vec<String>,
    trailing_error: Option<CoreError>,
    delay: Duration,
) -> TokenStream {
    let (tx, rx) = mpsc::channel(tokens.len().max(1) + 1);
    tokio::spawn(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        for token in tokens {
            if tx.send(Ok(token)).await.is_err() {
                return;
            }
        }
        if let Some(e) = trailing_error {
            let _ = tx.send(Err(e)).await;
        }
    });
    TokenStream::new(rx)
}

/// Base64-encode i16 samples as little-endian PCM, the `ain`/`tts` wire form.
pub fn encode_pcm16(samples: &[i16]) -> String {
    use base64::Engine as _;
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
