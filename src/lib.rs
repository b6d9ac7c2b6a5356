//! Colloquy: real-time incremental spoken-dialogue middleware.
//!
//! A human speaks to a virtual agent; the agent listens, reacts while the
//! user is still talking, decides when the turn has been yielded, streams a
//! response out through speech synthesis, and stops itself when the user
//! barges in.
//!
//! # Architecture
//!
//! Independent modules exchange incremental, revocable messages
//! ([`iu::IncrementalUnit`]) over fan-out exchanges on a pub/sub bus:
//! - **ASR adapter**: raw audio → incremental recognition tokens
//! - **Audio VAP**: both speakers' waveforms → turn events and scores
//! - **Text VAP**: transcript → backchannels, reactions, turn-yield, and
//!   the silence-timeout commit
//! - **Dialogue manager**: turn-taking state machine, speculative response
//!   generation, barge-in
//! - **TTS pipeline**: response text → paced audio chunks with revoke-aware
//!   flushing
//!
//! The broker contract is [`broker::Broker`]; deployments use NATS
//! ([`broker::nats::NatsBroker`]) or the in-process bus
//! ([`broker::local::LocalBus`]).

pub mod asr;
pub mod broker;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod iu;
pub mod llm;
pub mod runtime;
pub mod test_utils;
pub mod tts;
pub mod vap;

pub use config::Config;
pub use error::{CoreError, Result};
pub use runtime::{Collaborators, ModuleSelection, Runtime};
