//! Module assembly and lifecycle.
//!
//! Wires each enabled module to the broker under one cancellation token,
//! the way a process supervisor would: every module runs as its own task,
//! a module that exits (fatally or not) never takes the others down, and
//! shutdown joins everything.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::asr::{AsrAdapter, Recognizer};
use crate::broker::Broker;
use crate::config::Config;
use crate::dialogue::DialogueManager;
use crate::error::{CoreError, Result};
use crate::llm::prompts::Prompts;
use crate::llm::respond::ResponseGenerator;
use crate::llm::ChatBackend;
use crate::tts::{Synthesizer, TtsPipeline};
use crate::vap::audio::{AudioVap, TurnModel};
use crate::vap::text::TextVap;

/// Which modules this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleSelection {
    /// Speech recognition adapter.
    pub asr: bool,
    /// Audio-based turn predictor.
    pub audio_vap: bool,
    /// Text-based turn predictor.
    pub text_vap: bool,
    /// Dialogue manager.
    pub dialogue: bool,
    /// Text-to-speech pipeline.
    pub tts: bool,
}

impl Default for ModuleSelection {
    fn default() -> Self {
        Self {
            asr: true,
            audio_vap: true,
            text_vap: true,
            dialogue: true,
            tts: true,
        }
    }
}

impl ModuleSelection {
    /// Parse a comma-separated module list (`asr,dialogue,tts`).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] for an unknown module name.
    pub fn parse(list: &str) -> Result<Self> {
        let mut selection = Self {
            asr: false,
            audio_vap: false,
            text_vap: false,
            dialogue: false,
            tts: false,
        };
        for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match name {
                "asr" => selection.asr = true,
                "audio_vap" => selection.audio_vap = true,
                "text_vap" => selection.text_vap = true,
                "dialogue" => selection.dialogue = true,
                "tts" => selection.tts = true,
                other => {
                    return Err(CoreError::Config(format!("unknown module: {other}")));
                }
            }
        }
        Ok(selection)
    }
}

/// External collaborators injected into the modules.
///
/// The recognizer and turn model are out-of-scope implementations; when one
/// is absent the module that needs it is skipped with a warning instead of
/// failing the whole process.
pub struct Collaborators {
    /// Streaming speech recognizer (for the ASR adapter).
    pub recognizer: Option<Arc<dyn Recognizer>>,
    /// Neural turn model (for the audio VAP).
    pub turn_model: Option<Arc<dyn TurnModel>>,
    /// Chat backend shared by the dialogue manager and Text-VAP.
    pub chat: Arc<dyn ChatBackend>,
    /// Synthesis engine for the TTS pipeline.
    pub synthesizer: Arc<dyn Synthesizer>,
}

/// Runs the selected modules until shutdown.
pub struct Runtime {
    config: Config,
    cancel: CancellationToken,
}

impl Runtime {
    /// Create a runtime for the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Clone of the cancellation token for external shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn the selected modules over `broker` and join them on shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error only for failures before the modules start (prompt
    /// loading, subscriptions). A module that exits at runtime is logged and
    /// the rest keep running.
    pub async fn run(
        &self,
        broker: Arc<dyn Broker>,
        selection: ModuleSelection,
        collaborators: Collaborators,
    ) -> Result<()> {
        let prompts = Prompts::load(&self.config.llm)?;
        let mut handles = Vec::new();

        if selection.asr {
            match &collaborators.recognizer {
                Some(recognizer) => {
                    let adapter = AsrAdapter::new(
                        Arc::clone(&broker),
                        Arc::clone(recognizer),
                        self.config.asr.clone(),
                    );
                    handles.push(spawn_module("asr", adapter.run(self.cancel.clone())));
                }
                None => warn!("no recognizer provided; skipping ASR module"),
            }
        }

        if selection.audio_vap {
            match &collaborators.turn_model {
                Some(model) => {
                    let vap = AudioVap::new(Arc::clone(&broker), Arc::clone(model), &self.config);
                    handles.push(spawn_module("audio_vap", vap.run(self.cancel.clone())));
                }
                None => warn!("no turn model provided; skipping audio VAP module"),
            }
        }

        if selection.text_vap {
            let text_vap = TextVap::new(
                Arc::clone(&broker),
                Arc::clone(&collaborators.chat),
                &self.config,
                prompts.clone(),
            );
            handles.push(spawn_module("text_vap", text_vap.run(self.cancel.clone())));
        }

        if selection.dialogue {
            let generator = Arc::new(ResponseGenerator::new(
                Arc::clone(&collaborators.chat),
                self.config.llm.clone(),
                prompts.clone(),
            ));
            let manager = DialogueManager::new(Arc::clone(&broker), generator, &self.config);
            handles.push(spawn_module("dialogue", manager.run(self.cancel.clone())));
        }

        if selection.tts {
            let pipeline = TtsPipeline::new(
                Arc::clone(&broker),
                Arc::clone(&collaborators.synthesizer),
                &self.config.tts,
            );
            handles.push(spawn_module("tts", pipeline.run(self.cancel.clone())));
        }

        if handles.is_empty() {
            return Err(CoreError::Config("no modules selected".to_owned()));
        }

        info!("{} modules running", handles.len());
        self.cancel.cancelled().await;
        info!("shutting down");

        for handle in handles {
            let _ = handle.await;
        }
        broker.close().await?;
        info!("shutdown complete");
        Ok(())
    }
}

fn spawn_module(
    name: &'static str,
    fut: impl std::future::Future<Output = Result<()>> + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match fut.await {
            Ok(()) => info!("module {name} exited"),
            // A fatal module error never takes the other modules down.
            Err(e) => error!("module {name} failed: {e}"),
        }
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn module_selection_parses_lists() {
        let s = ModuleSelection::parse("asr, dialogue,tts").unwrap();
        assert!(s.asr && s.dialogue && s.tts);
        assert!(!s.audio_vap && !s.text_vap);

        assert!(matches!(
            ModuleSelection::parse("asr,webcam"),
            Err(CoreError::Config(_))
        ));
    }
}
