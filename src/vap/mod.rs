//! Turn-taking predictors.
//!
//! Two complementary detectors feed the dialogue manager over the `vap`
//! exchange: [`audio::AudioVap`] watches both speakers' waveforms through a
//! neural turn model, and [`text::TextVap`] watches the incremental
//! transcript through an LLM classifier and owns the silence-timeout commit.

pub mod audio;
pub mod text;
