//! System prompts for response generation and reaction classification.
//!
//! Prompts are plain text files referenced from the configuration; when a
//! path is absent the embedded defaults are used so the system runs without
//! external assets.

use crate::config::LlmConfig;
use crate::error::{CoreError, Result};

/// Default prompt for responding to a user utterance.
const DEFAULT_RESPONSE_PROMPT: &str = "\
You are a friendly spoken-dialogue agent. Reply briefly and conversationally, \
in one or two short sentences. Mark the end of each spoken phrase with '/'. \
After the final phrase, append an expression and action marker of the form \
<expression_id>_<label>|<action_id>_<label>.";

/// Default prompt for self-initiated turns after user silence.
const DEFAULT_TAKE_TURN_PROMPT: &str = "\
The user has been silent. Say something brief and natural to keep the \
conversation going, such as a gentle prompt or a related remark. Mark the \
end of each spoken phrase with '/'.";

/// Default classification prompt for the text-based turn predictor.
const DEFAULT_REACTION_PROMPT: &str = "\
You observe a partial user utterance from a live speech recognizer. Reply \
with exactly four lines:\n\
a: a short verbal backchannel if one is appropriate right now, else empty\n\
b: one facial expression label (normal, joy, impressed, convinced, thinking, \
sleepy, sad, surprise, angry)\n\
c: one action label (wait, listening, nod, head_tilt, thinking, greeting, \
strong_nod, light_nod, deep_breath)\n\
d: an integer 0-10 scoring how complete the utterance is (10 = the user has \
clearly yielded the turn)";

/// Loaded prompt set.
#[derive(Debug, Clone)]
pub struct Prompts {
    /// Prompt for responding to a user utterance (`RESP`).
    pub response: String,
    /// Prompt for self-initiated turns (`TO`).
    pub take_turn: String,
    /// Classification prompt for Text-VAP.
    pub reaction: String,
}

impl Prompts {
    /// Load prompts from the configured paths, falling back to the embedded
    /// defaults for any path left unset.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] if a configured path cannot be read.
    pub fn load(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            response: load_or_default(
                config.response_prompt_path.as_deref(),
                DEFAULT_RESPONSE_PROMPT,
            )?,
            take_turn: load_or_default(
                config.take_turn_prompt_path.as_deref(),
                DEFAULT_TAKE_TURN_PROMPT,
            )?,
            reaction: load_or_default(
                config.reaction_prompt_path.as_deref(),
                DEFAULT_REACTION_PROMPT,
            )?,
        })
    }
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            response: DEFAULT_RESPONSE_PROMPT.to_owned(),
            take_turn: DEFAULT_TAKE_TURN_PROMPT.to_owned(),
            reaction: DEFAULT_REACTION_PROMPT.to_owned(),
        }
    }
}

fn load_or_default(path: Option<&str>, default: &str) -> Result<String> {
    match path {
        None => Ok(default.to_owned()),
        Some(p) => std::fs::read_to_string(p)
            .map(|s| s.trim_end().to_owned())
            .map_err(|e| CoreError::Config(format!("cannot read prompt {p}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn defaults_used_when_paths_unset() {
        let prompts = Prompts::load(&LlmConfig::default()).unwrap();
        assert!(prompts.reaction.contains("a:"));
        assert!(prompts.response.contains('/'));
    }

    #[test]
    fn configured_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resp.txt");
        std::fs::write(&path, "custom prompt\n").unwrap();
        let config = LlmConfig {
            response_prompt_path: Some(path.to_string_lossy().into_owned()),
            ..Default::default()
        };
        let prompts = Prompts::load(&config).unwrap();
        assert_eq!(prompts.response, "custom prompt");
    }

    #[test]
    fn missing_prompt_file_is_fatal_config() {
        let config = LlmConfig {
            reaction_prompt_path: Some("/nonexistent/reaction.txt".to_owned()),
            ..Default::default()
        };
        assert!(matches!(
            Prompts::load(&config),
            Err(CoreError::Config(_))
        ));
    }
}
