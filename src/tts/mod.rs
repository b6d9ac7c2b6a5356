//! Text-to-speech pipeline.
//!
//! Consumes system phrases on `dialogue`, synthesizes them through the
//! configured engine, and publishes paced base64 PCM chunks on `tts`. A
//! REVOKE on `dialogue` (barge-in) flushes both the synthesis backlog and
//! the outgoing chunk queue and closes the stream with an immediate COMMIT
//! so downstream consumers transition cleanly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::{exchange, Broker};
use crate::config::TtsConfig;
use crate::error::{CoreError, Result};
use crate::iu::{Body, IncrementalUnit, IuProducer, UpdateType};

/// Synthesis engine seam (the engine itself is external).
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize text to f32 mono samples at [`Synthesizer::sample_rate`].
    async fn synthesize(&self, text: &str) -> Result<Vec<f32>>;

    /// Native output sample rate of the engine.
    fn sample_rate(&self) -> u32;
}

/// Debug engine: a fixed tone whose duration tracks the text length.
/// Useful for running the full pipeline without a real synthesizer.
pub struct SineSynthesizer {
    sample_rate: u32,
}

impl SineSynthesizer {
    /// Create the engine at the given sample rate.
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

#[async_trait]
impl Synthesizer for SineSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<f32>> {
        let seconds = (text.chars().count() as f64 * 0.06).max(0.2);
        let n = (seconds * f64::from(self.sample_rate)) as usize;
        let step = 2.0 * std::f64::consts::PI * 440.0 / f64::from(self.sample_rate);
        Ok((0..n).map(|i| ((i as f64 * step).sin() * 0.5) as f32).collect())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Build the engine named in the configuration.
///
/// # Errors
///
/// An unknown engine name is a fatal [`CoreError::Config`]: the TTS module
/// exits while the rest of the system keeps running.
pub fn engine_from_config(config: &TtsConfig) -> Result<Arc<dyn Synthesizer>> {
    match config.engine_name.as_str() {
        "sine" => Ok(Arc::new(SineSynthesizer::new(config.org_sample_rate))),
        other => Err(CoreError::Config(format!("unknown TTS engine: {other}"))),
    }
}

/// Linear-interpolation resampler.
pub fn resample(samples: &[f32], org_rate: u32, dst_rate: u32) -> Vec<f32> {
    if org_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = f64::from(org_rate) / f64::from(dst_rate);
    let out_len = ((samples.len() as f64) / ratio).floor() as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let base = pos.floor() as usize;
            let frac = (pos - pos.floor()) as f32;
            let a = samples[base.min(samples.len() - 1)];
            let b = samples[(base + 1).min(samples.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

/// Scale and quantize f32 samples to 16-bit PCM.
fn quantize(samples: &[f32], scale_factor: f32) -> Vec<i16> {
    samples
        .iter()
        .map(|s| (s * scale_factor * 32767.0).clamp(-32768.0, 32767.0) as i16)
        .collect()
}

fn encode_chunk(samples: &[i16]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Messages between the synthesis and send stages, tagged with the flush
/// generation they belong to.
enum OutMsg {
    Chunk(IncrementalUnit),
    EndOfTurn,
}

/// The TTS module.
pub struct TtsPipeline {
    broker: Arc<dyn Broker>,
    engine: Arc<dyn Synthesizer>,
    config: TtsConfig,
    producer: Arc<IuProducer>,
}

impl TtsPipeline {
    /// Create the pipeline over a broker and a synthesis engine.
    pub fn new(broker: Arc<dyn Broker>, engine: Arc<dyn Synthesizer>, config: &TtsConfig) -> Self {
        Self {
            broker,
            engine,
            config: config.clone(),
            producer: Arc::new(IuProducer::new("tts")),
        }
    }

    /// Run until cancelled.
    ///
    /// # Errors
    ///
    /// Returns broker subscription errors; synthesis failures are logged
    /// and the phrase skipped.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut sub = self.broker.subscribe(exchange::DIALOGUE).await?;
        let chunk_samples =
            ((self.config.frame_length * f64::from(self.config.dst_sample_rate)) as usize).max(1);

        // Flush generation: bumped on REVOKE; both stages drop anything
        // tagged with an older generation.
        let generation = Arc::new(AtomicU64::new(0));

        let (synth_tx, mut synth_rx) = mpsc::channel::<(u64, IncrementalUnit)>(64);
        let (out_tx, mut out_rx) = mpsc::channel::<(u64, OutMsg)>(256);

        // Synthesis stage: text to framed chunk IUs.
        {
            let engine = Arc::clone(&self.engine);
            let producer = Arc::clone(&self.producer);
            let config = self.config.clone();
            let generation = Arc::clone(&generation);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let (gen, iu) = tokio::select! {
                        () = cancel.cancelled() => break,
                        msg = synth_rx.recv() => match msg {
                            Some(msg) => msg,
                            None => break,
                        },
                    };
                    if gen != generation.load(Ordering::Acquire) {
                        // Input backlog from before a flush.
                        continue;
                    }

                    let text = iu.body.as_text().unwrap_or_default();
                    let pcm: Vec<i16> = if text.is_empty() {
                        // Keep downstream time alignment with one silent frame.
                        vec![0; chunk_samples]
                    } else {
                        let samples = match engine.synthesize(text).await {
                            Ok(s) => s,
                            Err(e) => {
                                warn!("synthesis failed: {e}");
                                continue;
                            }
                        };
                        let resampled =
                            resample(&samples, engine.sample_rate(), config.dst_sample_rate);
                        quantize(&resampled, config.scale_factor)
                    };

                    if gen != generation.load(Ordering::Acquire) {
                        continue;
                    }

                    for chunk in pcm.chunks(chunk_samples) {
                        let mut out = producer.make_iu(
                            Body::Audio(encode_chunk(chunk)),
                            exchange::TTS,
                            UpdateType::Add,
                        );
                        out.data_type = Some("audio".to_owned());
                        if out_tx.send((gen, OutMsg::Chunk(out))).await.is_err() {
                            return;
                        }
                    }
                    if iu.update_type == UpdateType::Commit
                        && out_tx.send((gen, OutMsg::EndOfTurn)).await.is_err()
                    {
                        return;
                    }
                }
            });
        }

        // Send stage: paced publication on `tts`.
        {
            let broker = Arc::clone(&self.broker);
            let producer = Arc::clone(&self.producer);
            let generation = Arc::clone(&generation);
            let send_interval = std::time::Duration::from_secs_f64(self.config.send_interval.max(0.0));
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let (gen, msg) = tokio::select! {
                        () = cancel.cancelled() => break,
                        msg = out_rx.recv() => match msg {
                            Some(msg) => msg,
                            None => break,
                        },
                    };
                    if gen != generation.load(Ordering::Acquire) {
                        // Output backlog from before a flush.
                        continue;
                    }
                    match msg {
                        OutMsg::Chunk(iu) => {
                            if let Err(e) = broker.publish(exchange::TTS, &iu).await {
                                warn!("tts publish failed: {e}");
                            }
                            // Pace chunks slightly faster than real time so
                            // playback never starves.
                            tokio::time::sleep(send_interval).await;
                        }
                        OutMsg::EndOfTurn => {
                            publish_commit(&broker, &producer).await;
                        }
                    }
                }
            });
        }

        info!(
            "TTS pipeline running ({} -> {} Hz, frame {:.0}ms)",
            self.config.org_sample_rate,
            self.config.dst_sample_rate,
            self.config.frame_length * 1000.0
        );

        let mut dirty = false;
        loop {
            let iu = tokio::select! {
                () = cancel.cancelled() => break,
                iu = sub.recv() => match iu {
                    Some(iu) => iu,
                    None => break,
                },
            };
            match iu.update_type {
                UpdateType::Revoke => {
                    // Barge-in: invalidate both backlogs and close the audio
                    // stream immediately. A pile of REVOKEs (one per
                    // withdrawn phrase) flushes once.
                    if dirty {
                        generation.fetch_add(1, Ordering::Release);
                        publish_commit(&self.broker, &self.producer).await;
                        dirty = false;
                    }
                }
                UpdateType::Add | UpdateType::Commit => {
                    dirty = true;
                    let gen = generation.load(Ordering::Acquire);
                    if synth_tx.send((gen, iu)).await.is_err() {
                        break;
                    }
                }
            }
        }

        info!("TTS pipeline shut down");
        Ok(())
    }
}

async fn publish_commit(broker: &Arc<dyn Broker>, producer: &Arc<IuProducer>) {
    let mut commit = producer.make_iu(Body::Text(String::new()), exchange::TTS, UpdateType::Commit);
    commit.data_type = Some("audio".to_owned());
    if let Err(e) = broker.publish(exchange::TTS, &commit).await {
        warn!("tts commit publish failed: {e}");
    }
}
