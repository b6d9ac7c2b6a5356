//! Error types for the dialogue middleware.

/// Top-level error type for the incremental dialogue system.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Transient transport error (broker disconnect, upstream 5xx).
    /// Retried with backoff at the boundary where it occurs.
    #[error("transport error: {0}")]
    Transport(String),

    /// Fatal configuration error (missing credentials, unknown engine).
    /// The affected module exits; others continue.
    #[error("config error: {0}")]
    Config(String),

    /// Protocol violation (malformed IU, REVOKE of unknown id).
    /// The offending IU is dropped and counted.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A bounded wait expired (LLM response, silence watch).
    #[error("timed out: {0}")]
    Timeout(String),

    /// Task or stream was cancelled. Expected, not an error condition.
    #[error("cancelled")]
    Cancelled,

    /// Speech recognition error.
    #[error("ASR error: {0}")]
    Asr(String),

    /// Language model inference error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Whether this error should be retried with backoff rather than
    /// terminating the module.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, CoreError>;
