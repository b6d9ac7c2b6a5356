//! Configuration types for the dialogue middleware.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CoreError, Result};

/// Top-level configuration, one section per module.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection settings.
    pub broker: BrokerConfig,
    /// Speech recognition adapter settings.
    pub asr: AsrConfig,
    /// Audio VAP (turn predictor) settings.
    pub audio_vap: AudioVapConfig,
    /// Text VAP (reaction / turn-yield detector) settings.
    pub text_vap: TextVapConfig,
    /// Timeout settings shared across modules.
    pub timeout: TimeoutConfig,
    /// Dialogue manager settings.
    pub dialogue: DialogueConfig,
    /// LLM provider settings.
    pub llm: LlmConfig,
    /// Text-to-speech pipeline settings.
    pub tts: TtsConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        toml::from_str(&raw)
            .map_err(|e| CoreError::Config(format!("cannot parse config {}: {e}", path.display())))
    }
}

/// Broker connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker URL (e.g. `nats://localhost:4222`).
    pub host: String,
    /// Minimum reconnect backoff in seconds.
    pub reconnect_min_secs: u64,
    /// Maximum reconnect backoff in seconds.
    pub reconnect_max_secs: u64,
    /// How long `publish` waits for a live connection before dropping the
    /// message with a warning, in seconds.
    pub publish_grace_secs: f64,
    /// Per-subscriber queue bound. A consumer that falls further behind is
    /// disconnected and rebound, losing the intervening messages.
    pub subscriber_queue_bound: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "nats://localhost:4222".to_owned(),
            reconnect_min_secs: 1,
            reconnect_max_secs: 30,
            publish_grace_secs: 2.0,
            subscriber_queue_bound: 1024,
        }
    }
}

/// Speech recognition adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrConfig {
    /// Microphone sample rate in Hz.
    pub sample_rate: u32,
    /// Producer chunk size in samples.
    pub chunk_size: usize,
    /// Internal audio queue bound, in chunks.
    pub buff_size: usize,
    /// Streaming session cap in seconds; the session rotates before the
    /// upstream recognizer would cut it off.
    pub streaming_limit_secs: f64,
    /// Path to the recognizer credentials file.
    pub credentials_path: Option<String>,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            chunk_size: 800,
            buff_size: 128,
            streaming_limit_secs: 240.0,
            credentials_path: None,
        }
    }
}

/// Audio VAP configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioVapConfig {
    /// Path to the turn-predictor model checkpoint.
    pub model_filename: String,
    /// Ring buffer length in seconds (also the inference cadence).
    pub buffer_length: f64,
    /// Event threshold `s`; the opposing threshold is `1 - s`.
    pub threshold: f64,
}

impl Default for AudioVapConfig {
    fn default() -> Self {
        Self {
            model_filename: String::new(),
            buffer_length: 10.0,
            threshold: 0.6,
        }
    }
}

/// Text VAP configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TextVapConfig {
    /// Classify every N ASR ADDs even without a meaningful change.
    pub text_vap_interval: usize,
    /// Minimum turn-yield score (0-10) that triggers SYSTEM_TAKE_TURN.
    pub min_text_vap_threshold: u8,
    /// Maximum verbal backchannels per user utterance.
    pub max_verbal_backchannel_num: usize,
    /// Maximum nonverbal reactions per user utterance.
    pub max_nonverbal_backchannel_num: usize,
    /// Token join string for the accumulator.
    pub spacer: String,
}

impl Default for TextVapConfig {
    fn default() -> Self {
        Self {
            text_vap_interval: 3,
            min_text_vap_threshold: 7,
            max_verbal_backchannel_num: 2,
            max_nonverbal_backchannel_num: 2,
            spacer: " ".to_owned(),
        }
    }
}

/// Timeouts shared across modules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Silence after the last ASR ADD before Text-VAP auto-commits, in seconds.
    pub max_silence_time: f64,
    /// How long the dialogue manager waits for a response stream before
    /// falling back to the default phrase, in seconds.
    pub llm_wait_secs: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            max_silence_time: 3.0,
            llm_wait_secs: 10.0,
        }
    }
}

/// Dialogue manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueConfig {
    /// Number of turns kept per side in the dialogue history.
    pub history_length: usize,
    /// Launch a speculative response attempt every N ASR ADDs.
    pub response_generation_interval: usize,
    /// Verbal backchannels to pick from in the idle state.
    pub backchannels: Vec<String>,
    /// Token join string when assembling the user utterance.
    pub spacer: String,
    /// Phrase spoken when no response stream arrives within the LLM wait.
    pub default_phrase: String,
    /// Phrase spoken on catastrophic LLM failure.
    pub apology_phrase: String,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            history_length: 10,
            response_generation_interval: 3,
            backchannels: vec!["uh-huh".to_owned(), "mm-hm".to_owned(), "right".to_owned()],
            spacer: " ".to_owned(),
            default_phrase: "Well, let me think about that.".to_owned(),
            apology_phrase: "Sorry, I didn't quite catch that. Could you repeat?".to_owned(),
        }
    }
}

/// LLM provider configuration (OpenAI-compatible chat completions API).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the API server.
    pub api_url: String,
    /// API key; empty disables the Authorization header.
    pub api_key: String,
    /// Model used for full response generation.
    pub response_generation_model: String,
    /// Model used for Text-VAP reaction classification.
    pub reaction_model: String,
    /// Maximum tokens per completion.
    pub max_tokens: u32,
    /// History turns included in the response context.
    pub max_message_num_in_context: usize,
    /// Punctuation characters that end a phrase fragment.
    pub split_characters: String,
    /// System prompt for responding to a user utterance.
    pub response_prompt_path: Option<String>,
    /// System prompt for self-initiated turns.
    pub take_turn_prompt_path: Option<String>,
    /// Classification prompt for Text-VAP.
    pub reaction_prompt_path: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com".to_owned(),
            api_key: String::new(),
            response_generation_model: "gpt-4o-mini".to_owned(),
            reaction_model: "gpt-4o-mini".to_owned(),
            max_tokens: 64,
            max_message_num_in_context: 6,
            split_characters: ".!?,".to_owned(),
            response_prompt_path: None,
            take_turn_prompt_path: None,
            reaction_prompt_path: None,
        }
    }
}

/// Text-to-speech pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Synthesis engine name; unknown names are a fatal config error.
    pub engine_name: String,
    /// Engine voice/model name.
    pub model_name: String,
    /// Engine output sample rate in Hz.
    pub org_sample_rate: u32,
    /// Published audio sample rate in Hz.
    pub dst_sample_rate: u32,
    /// Amplitude scale applied before quantization.
    pub scale_factor: f32,
    /// Audio frame length in seconds; one published chunk per frame.
    pub frame_length: f64,
    /// Pacing delay between published chunks, in seconds. Kept slightly
    /// under one frame so playback never starves.
    pub send_interval: f64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            engine_name: "sine".to_owned(),
            model_name: String::new(),
            org_sample_rate: 24_000,
            dst_sample_rate: 16_000,
            scale_factor: 0.8,
            frame_length: 0.1,
            send_interval: 0.09,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.asr.streaming_limit_secs, 240.0);
        assert_eq!(config.timeout.max_silence_time, 3.0);
        assert_eq!(config.timeout.llm_wait_secs, 10.0);
        assert_eq!(config.broker.publish_grace_secs, 2.0);
        assert_eq!(config.broker.reconnect_min_secs, 1);
        assert_eq!(config.broker.reconnect_max_secs, 30);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let raw = r#"
            [dialogue]
            history_length = 4

            [text_vap]
            max_verbal_backchannel_num = 1
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.dialogue.history_length, 4);
        assert_eq!(config.text_vap.max_verbal_backchannel_num, 1);
        // Untouched sections keep their defaults.
        assert_eq!(config.tts.dst_sample_rate, 16_000);
    }

    #[test]
    fn load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = Config::default();
        std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.dialogue.history_length, config.dialogue.history_length);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = Config::load(Path::new("/nonexistent/colloquy.toml")).unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }
}
