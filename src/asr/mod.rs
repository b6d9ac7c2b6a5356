//! Speech recognition adapter.
//!
//! Bridges raw microphone audio from the `ain` exchange into a streaming
//! recognizer session and republishes the recognizer's interim snapshots as
//! incremental `asr` IUs: unchanged prefixes are retained, diverging tails
//! are REVOKEd, fresh tokens are ADDed, and the final snapshot closes the
//! utterance with a COMMIT.
//!
//! Streaming sessions are rotated before the upstream duration cap so a long
//! conversation never hits the provider's hard cutoff. Rotation preserves the
//! published token sequence: no REVOKEs are emitted for tokens that survive
//! the session boundary.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::{exchange, record_protocol_violation, Broker};
use crate::config::AsrConfig;
use crate::error::{CoreError, Result};
use crate::iu::{diff_tokens, revoke_of, Body, IncrementalUnit, IuProducer, UpdateType};

/// Placeholder stability stamped on interim ADD tokens.
const INTERIM_STABILITY: f64 = 0.0;
/// Placeholder confidence stamped on interim ADD tokens.
const INTERIM_CONFIDENCE: f64 = 0.99;

/// One interim result from the streaming recognizer.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Concatenated transcript of the current utterance so far.
    pub transcript: String,
    /// Upstream stability score for the snapshot.
    pub stability: f64,
    /// Upstream confidence score for the snapshot.
    pub confidence: f64,
    /// Whether this snapshot ends the utterance.
    pub is_final: bool,
}

/// An open streaming session: PCM in, snapshots out.
///
/// Dropping the session closes the audio channel; the recognizer drains and
/// returns.
pub struct RecognizerSession {
    /// Raw 16-bit little-endian PCM chunks.
    pub audio_tx: mpsc::Sender<Vec<u8>>,
    /// Interim recognition snapshots.
    pub snapshots: mpsc::Receiver<Snapshot>,
}

/// External streaming recognizer seam (the cloud recognizer itself is out of
/// scope; only this interface is consumed).
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Open a fresh streaming session.
    ///
    /// # Errors
    ///
    /// [`CoreError::Config`] is fatal to the ASR module (bad credentials,
    /// quota exhausted); any other error restarts the session.
    async fn open_session(&self) -> Result<RecognizerSession>;
}

/// Reconciles recognizer snapshots against the published token stream.
///
/// Keeps the currently-valid ADD IUs (`current_output`) and, per snapshot,
/// computes the exact REVOKE/ADD/COMMIT sequence to publish. A session base
/// index marks where the live session's tokens begin so that rotation never
/// touches tokens published by earlier sessions.
struct TokenReconciler {
    current_output: Vec<IncrementalUnit>,
    session_base: usize,
}

impl TokenReconciler {
    fn new() -> Self {
        Self {
            current_output: Vec::new(),
            session_base: 0,
        }
    }

    /// Mark the start of a fresh session: its snapshots describe only audio
    /// fed after this point, so diffs must ignore earlier tokens.
    fn begin_session(&mut self) {
        self.session_base = self.current_output.len();
    }

    /// Apply one snapshot; returns the IUs to publish, in order.
    fn apply(&mut self, producer: &IuProducer, snapshot: &Snapshot) -> Vec<IncrementalUnit> {
        let tokens: Vec<String> = snapshot
            .transcript
            .split_whitespace()
            .map(str::to_owned)
            .collect();

        let mut out = Vec::new();

        if tokens.is_empty() {
            if snapshot.is_final {
                out.push(self.commit_iu(producer, String::new(), snapshot));
                self.finish_utterance();
            }
            return out;
        }

        let visible: Vec<String> = self.current_output[self.session_base..]
            .iter()
            .filter_map(|iu| iu.body.as_text().map(str::to_owned))
            .collect();
        let (revokes, adds) = diff_tokens(&visible, &tokens);

        // Withdraw the diverging tail, newest first.
        let keep = self.current_output.len() - revokes.len();
        for iu in self.current_output.drain(keep..).rev() {
            out.push(revoke_of(&iu));
        }

        let last = adds.len().saturating_sub(1);
        for (i, token) in adds.iter().enumerate() {
            if snapshot.is_final && i == last {
                // The closing token rides on the COMMIT itself.
                out.push(self.commit_iu(producer, token.clone(), snapshot));
            } else {
                let mut iu =
                    producer.make_iu(Body::Text(token.clone()), exchange::ASR, UpdateType::Add);
                iu.stability = Some(INTERIM_STABILITY);
                iu.confidence = Some(INTERIM_CONFIDENCE);
                self.current_output.push(iu.clone());
                out.push(iu);
            }
        }

        if snapshot.is_final {
            if adds.is_empty() {
                out.push(self.commit_iu(producer, String::new(), snapshot));
            }
            self.finish_utterance();
        }

        out
    }

    fn commit_iu(
        &self,
        producer: &IuProducer,
        body: String,
        snapshot: &Snapshot,
    ) -> IncrementalUnit {
        let mut iu = producer.make_iu(Body::Text(body), exchange::ASR, UpdateType::Commit);
        iu.stability = Some(snapshot.stability);
        iu.confidence = Some(snapshot.confidence);
        iu
    }

    fn finish_utterance(&mut self) {
        self.current_output.clear();
        self.session_base = 0;
    }
}

/// The ASR module: `ain` audio in, incremental `asr` IUs out.
pub struct AsrAdapter {
    broker: Arc<dyn Broker>,
    recognizer: Arc<dyn Recognizer>,
    config: AsrConfig,
    producer: IuProducer,
}

impl AsrAdapter {
    /// Create the adapter over a broker and a recognizer implementation.
    pub fn new(
        broker: Arc<dyn Broker>,
        recognizer: Arc<dyn Recognizer>,
        config: AsrConfig,
    ) -> Self {
        Self {
            broker,
            recognizer,
            config,
            producer: IuProducer::new("asr"),
        }
    }

    /// Run until cancelled or the audio stream ends.
    ///
    /// # Errors
    ///
    /// Returns a fatal [`CoreError::Config`] from the recognizer; transient
    /// recognizer errors restart the session instead.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut sub = self.broker.subscribe(exchange::AIN).await?;
        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(self.config.buff_size.max(1));

        // Decode task: base64 `ain` bodies to raw PCM. An empty body marks
        // end-of-stream.
        let decode_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = decode_cancel.cancelled() => break,
                    iu = sub.recv() => {
                        let Some(iu) = iu else { break };
                        // Producers are not required to set the audio
                        // data_type; a bare string body is still base64 PCM.
                        let (Body::Audio(b64) | Body::Text(b64)) = &iu.body else {
                            record_protocol_violation(exchange::AIN, "non-audio body");
                            continue;
                        };
                        if b64.is_empty() {
                            break;
                        }
                        match base64::engine::general_purpose::STANDARD.decode(b64) {
                            Ok(pcm) => {
                                if audio_tx.send(pcm).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                record_protocol_violation(
                                    exchange::AIN,
                                    &format!("bad base64 audio: {e}"),
                                );
                            }
                        }
                    }
                }
            }
        });

        let streaming_limit =
            std::time::Duration::from_secs_f64(self.config.streaming_limit_secs.max(1.0));
        let mut reconciler = TokenReconciler::new();

        'sessions: loop {
            if cancel.is_cancelled() {
                break;
            }

            let mut session = match self.recognizer.open_session().await {
                Ok(s) => s,
                Err(e @ CoreError::Config(_)) => {
                    // Credentials or quota: fatal to this module only.
                    return Err(e);
                }
                Err(e) => {
                    warn!("recognizer session failed to open: {e}; retrying");
                    tokio::select! {
                        () = cancel.cancelled() => break 'sessions,
                        () = tokio::time::sleep(std::time::Duration::from_secs(1)) => continue,
                    }
                }
            };

            reconciler.begin_session();
            let deadline = tokio::time::Instant::now() + streaming_limit;
            let mut resume_asr = false;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break 'sessions,
                    () = tokio::time::sleep_until(deadline) => {
                        // Approaching the upstream session cap: drain this
                        // session and open a fresh one.
                        resume_asr = true;
                        break;
                    }
                    chunk = audio_rx.recv() => {
                        match chunk {
                            Some(pcm) => {
                                if session.audio_tx.send(pcm).await.is_err() {
                                    warn!("recognizer session dropped its audio channel");
                                    break;
                                }
                            }
                            None => break 'sessions,
                        }
                    }
                    snapshot = session.snapshots.recv() => {
                        let Some(snapshot) = snapshot else {
                            warn!("recognizer session ended; restarting");
                            break;
                        };
                        for iu in reconciler.apply(&self.producer, &snapshot) {
                            self.broker.publish(exchange::ASR, &iu).await?;
                        }
                    }
                }
            }

            drop(session);
            if resume_asr {
                info!("resume: rotating recognizer session");
            }
        }

        info!("ASR adapter shut down");
        Ok(())
    }
}
