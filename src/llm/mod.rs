//! Chat-completion streaming over an OpenAI-compatible API.
//!
//! The provider is external; this module owns the SSE plumbing and the
//! token stream abstraction the response generator and Text-VAP build on.
//! Dropping a [`TokenStream`] cancels the underlying HTTP read promptly.

pub mod prompts;
pub mod respond;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::{CoreError, Result};

/// A single message in a chat context.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// `system`, `user`, or `assistant`.
    pub role: &'static str,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Shorthand constructor.
    pub fn new(role: &'static str, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A live stream of completion deltas.
///
/// Dropping the stream closes the channel; the producer task notices within
/// one chunk and stops consuming tokens.
pub struct TokenStream {
    rx: mpsc::Receiver<Result<String>>,
}

impl std::fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStream").finish_non_exhaustive()
    }
}

impl TokenStream {
    /// Wrap a receiver fed by a streaming backend.
    pub fn new(rx: mpsc::Receiver<Result<String>>) -> Self {
        Self { rx }
    }

    /// Next delta, `Some(Err(_))` exactly once on a mid-stream failure,
    /// `None` at end of stream.
    pub async fn next(&mut self) -> Option<Result<String>> {
        self.rx.recv().await
    }

    /// Drain the stream into one string. Used by callers that want the
    /// whole completion rather than incremental fragments.
    ///
    /// # Errors
    ///
    /// Propagates the first mid-stream error.
    pub async fn collect_text(mut self) -> Result<String> {
        let mut out = String::new();
        while let Some(delta) = self.next().await {
            out.push_str(&delta?);
        }
        Ok(out)
    }
}

/// Streaming chat backend seam. The production implementation talks to an
/// OpenAI-compatible server; tests script the stream.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Start a streaming completion for `messages`.
    async fn stream_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
    ) -> Result<TokenStream>;
}

/// Chat backend over an OpenAI-compatible `/v1/chat/completions` endpoint.
pub struct ApiChatClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl ApiChatClient {
    /// Build a client from the LLM section of the configuration.
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
        }
    }

    fn completions_url(&self) -> String {
        let base = self
            .api_url
            .strip_suffix("/v1")
            .unwrap_or(&self.api_url)
            .trim_end_matches('/');
        format!("{base}/v1/chat/completions")
    }
}

#[async_trait]
impl ChatBackend for ApiChatClient {
    async fn stream_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
    ) -> Result<TokenStream> {
        let messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| serde_json::json!({ "role": m.role, "content": m.content }))
            .collect();
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "max_tokens": max_tokens,
            "stream": true,
        });

        let mut request = self.http.post(self.completions_url()).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CoreError::Transport(format!("chat request failed: {e}")))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(CoreError::Transport(format!("chat API returned {status}")));
        }
        if !status.is_success() {
            return Err(CoreError::Llm(format!("chat API returned {status}")));
        }

        let (tx, rx) = mpsc::channel::<Result<String>>(64);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut pending = String::new();
            loop {
                tokio::select! {
                    // Consumer dropped the TokenStream: stop reading promptly.
                    () = tx.closed() => break,
                    chunk = stream.next() => {
                        let Some(chunk) = chunk else { break };
                        let chunk = match chunk {
                            Ok(c) => c,
                            Err(e) => {
                                let _ = tx
                                    .send(Err(CoreError::Transport(format!("chat stream: {e}"))))
                                    .await;
                                break;
                            }
                        };
                        pending.push_str(&String::from_utf8_lossy(&chunk));
                        while let Some(line_end) = pending.find('\n') {
                            let line = pending[..line_end].trim_end_matches('\r').to_owned();
                            pending.drain(..=line_end);
                            match parse_sse_line(&line) {
                                SseLine::Token(token) => {
                                    if tx.send(Ok(token)).await.is_err() {
                                        return;
                                    }
                                }
                                SseLine::Done => return,
                                SseLine::Skip => {}
                            }
                        }
                    }
                }
            }
        });

        Ok(TokenStream::new(rx))
    }
}

enum SseLine {
    Token(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data: ") else {
        return SseLine::Skip;
    };
    if data == "[DONE]" {
        return SseLine::Done;
    }
    let chunk: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            warn!("unparseable SSE chunk: {e}");
            return SseLine::Skip;
        }
    };
    if chunk["choices"][0]["finish_reason"].as_str() == Some("stop") {
        debug!("completion finished");
    }
    match chunk["choices"][0]["delta"]["content"].as_str() {
        Some(content) if !content.is_empty() => SseLine::Token(content.to_owned()),
        _ => SseLine::Skip,
    }
}

/// Find the first phrase boundary in `text` for the configured punctuation
/// class. Returns the byte index of the last byte of the boundary character,
/// so `text[..=pos]` and `text[pos + 1..]` are both char-safe.
pub(crate) fn find_split_boundary(text: &str, split_characters: &str) -> Option<usize> {
    for (i, c) in text.char_indices() {
        if split_characters.contains(c) {
            return Some(i + c.len_utf8() - 1);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;

    #[test]
    fn sse_line_parsing() {
        assert!(matches!(parse_sse_line(""), SseLine::Skip));
        assert!(matches!(parse_sse_line("data: [DONE]"), SseLine::Done));
        let line = r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#;
        match parse_sse_line(line) {
            SseLine::Token(t) => assert_eq!(t, "Hi"),
            _ => panic!("expected token"),
        }
        // Role-only deltas carry no content.
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert!(matches!(parse_sse_line(line), SseLine::Skip));
    }

    #[test]
    fn split_boundary_is_char_safe() {
        assert_eq!(find_split_boundary("hi. there", ".!?"), Some(2));
        assert_eq!(find_split_boundary("no boundary", ".!?"), None);
        // Multi-byte punctuation: the returned index is the last byte.
        let text = "はい。そう";
        let pos = find_split_boundary(text, "。").unwrap();
        assert!(text.is_char_boundary(pos + 1));
        assert_eq!(&text[..=pos], "はい。");
    }
}
