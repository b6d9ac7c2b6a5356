//! Audio-based turn predictor.
//!
//! Both speakers' waveforms are kept in fixed-length ring buffers: the user
//! channel fills straight from `ain`, while the system channel is aligned to
//! wall-clock by a buffering task that inserts silence whenever no `tts`
//! chunk arrives within one TTS frame. Each inference tick the buffers are
//! handed to the turn model; the final frame's probabilities drive the event
//! rule, and the raw scores go out on `score` for the UI.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine as _;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{exchange, record_protocol_violation, Broker};
use crate::config::Config;
use crate::error::Result;
use crate::iu::{Body, IncrementalUnit, IuProducer, TurnEvent, UpdateType};

/// Fixed-size f32 sample buffer with oldest-drop shifting.
pub struct RingBuffer {
    samples: Vec<f32>,
}

impl RingBuffer {
    /// Create a zero-filled buffer of `len` samples.
    pub fn new(len: usize) -> Self {
        Self {
            samples: vec![0.0; len.max(1)],
        }
    }

    /// Shift `chunk` in from the right, dropping the oldest samples.
    pub fn push(&mut self, chunk: &[f32]) {
        let len = self.samples.len();
        if chunk.len() >= len {
            self.samples.copy_from_slice(&chunk[chunk.len() - len..]);
            return;
        }
        self.samples.copy_within(chunk.len().., 0);
        self.samples[len - chunk.len()..].copy_from_slice(chunk);
    }

    /// Current contents, oldest first.
    pub fn snapshot(&self) -> Vec<f32> {
        self.samples.clone()
    }
}

/// Per-frame output of the turn model.
#[derive(Debug, Clone)]
pub struct TurnProbabilities {
    /// Probability per frame that the system should speak now.
    pub p_now: Vec<f32>,
    /// Probability per frame that the system should speak in the near future.
    pub p_future: Vec<f32>,
    /// Voice-activity per frame for (system, user).
    pub vad: Vec<(f32, f32)>,
}

/// Neural turn model seam (the acoustic model itself is out of scope).
#[async_trait]
pub trait TurnModel: Send + Sync {
    /// Run inference over the two aligned channel buffers.
    async fn probs(&self, system_audio: &[f32], user_audio: &[f32]) -> Result<TurnProbabilities>;
}

/// Event rule over the final frame's probabilities.
///
/// With threshold `s` and `u = 1 - s`: both high flips to the system's turn
/// unless a backchannel was just suggested; high-now/low-future right after
/// the user took the turn suggests a backchannel; both low returns the turn
/// to the user. Combinations outside the table emit nothing.
pub fn decide_event(
    p_now: f64,
    p_future: f64,
    prev_event: Option<TurnEvent>,
    threshold: f64,
) -> Option<TurnEvent> {
    let s = threshold;
    let u = 1.0 - threshold;
    if p_now >= s && p_future >= s {
        if prev_event != Some(TurnEvent::SystemBackchannel) {
            return Some(TurnEvent::SystemTakeTurn);
        }
    } else if p_now >= s && p_future < u {
        if prev_event == Some(TurnEvent::UserTakeTurn) {
            return Some(TurnEvent::SystemBackchannel);
        }
    } else if p_now < u && p_future < u {
        return Some(TurnEvent::UserTakeTurn);
    }
    None
}

/// Decode a base64 16-bit PCM body to mono f32 in [-1, 1].
fn decode_chunk(b64: &str) -> Option<Vec<f32>> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(b64).ok()?;
    Some(
        bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
            .collect(),
    )
}

/// The audio VAP module.
pub struct AudioVap {
    broker: Arc<dyn Broker>,
    model: Arc<dyn TurnModel>,
    producer: IuProducer,
    buffer_length: f64,
    threshold: f64,
    sample_rate: u32,
    tts_frame_length: f64,
}

impl AudioVap {
    /// Create the module over a broker and a turn model implementation.
    ///
    /// The system channel runs at the TTS destination sample rate, matching
    /// the audio published on `tts`.
    pub fn new(broker: Arc<dyn Broker>, model: Arc<dyn TurnModel>, config: &Config) -> Self {
        Self {
            broker,
            model,
            producer: IuProducer::new("audio_vap"),
            buffer_length: config.audio_vap.buffer_length,
            threshold: config.audio_vap.threshold,
            sample_rate: config.tts.dst_sample_rate,
            tts_frame_length: config.tts.frame_length,
        }
    }

    /// Run until cancelled.
    ///
    /// # Errors
    ///
    /// Returns broker subscription errors; inference errors are logged and
    /// the tick skipped.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let buffer_size = (self.buffer_length * f64::from(self.sample_rate)) as usize;
        let user_buffer = Arc::new(Mutex::new(RingBuffer::new(buffer_size)));
        let system_buffer = Arc::new(Mutex::new(RingBuffer::new(buffer_size)));

        // User channel: straight from `ain` into the ring.
        {
            let mut sub = self.broker.subscribe(exchange::AIN).await?;
            let user_buffer = Arc::clone(&user_buffer);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        iu = sub.recv() => {
                            let Some(iu) = iu else { break };
                            let (Body::Audio(b64) | Body::Text(b64)) = &iu.body else {
                                continue;
                            };
                            match decode_chunk(b64) {
                                Some(chunk) if !chunk.is_empty() => {
                                    user_buffer
                                        .lock()
                                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                                        .push(&chunk);
                                }
                                Some(_) => {}
                                None => record_protocol_violation(
                                    exchange::AIN,
                                    "bad base64 audio",
                                ),
                            }
                        }
                    }
                }
            });
        }

        // System channel: `tts` chunks queue up and a buffering task feeds
        // them into the ring one TTS frame at a time, padding with silence
        // when the queue is empty. This keeps the system channel registered
        // with the user channel in time.
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<f32>>(64);
        {
            let mut sub = self.broker.subscribe(exchange::TTS).await?;
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        iu = sub.recv() => {
                            let Some(iu) = iu else { break };
                            if iu.update_type != UpdateType::Add {
                                continue;
                            }
                            let Body::Audio(b64) = &iu.body else { continue };
                            match decode_chunk(b64) {
                                Some(chunk) => {
                                    if chunk_tx.send(chunk).await.is_err() {
                                        break;
                                    }
                                }
                                None => record_protocol_violation(
                                    exchange::TTS,
                                    "bad base64 audio",
                                ),
                            }
                        }
                    }
                }
            });
        }
        {
            let system_buffer = Arc::clone(&system_buffer);
            let frame_samples = (self.tts_frame_length * f64::from(self.sample_rate)) as usize;
            let frame = std::time::Duration::from_secs_f64(self.tts_frame_length.max(0.001));
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(frame);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let chunk = match chunk_rx.try_recv() {
                                Ok(chunk) => chunk,
                                Err(mpsc::error::TryRecvError::Empty) => vec![0.0; frame_samples],
                                Err(mpsc::error::TryRecvError::Disconnected) => break,
                            };
                            system_buffer
                                .lock()
                                .unwrap_or_else(std::sync::PoisonError::into_inner)
                                .push(&chunk);
                        }
                    }
                }
            });
        }

        info!(
            "audio VAP running (buffer {:.1}s @ {} Hz, threshold {})",
            self.buffer_length, self.sample_rate, self.threshold
        );

        let mut prev_event: Option<TurnEvent> = None;
        let tick = std::time::Duration::from_secs_f64(self.buffer_length.max(0.01));
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let user = user_buffer
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .snapshot();
                    let system = system_buffer
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .snapshot();

                    let probs = match self.model.probs(&system, &user).await {
                        Ok(p) => p,
                        Err(e) => {
                            warn!("turn model inference failed: {e}");
                            continue;
                        }
                    };
                    let (Some(&p_now), Some(&p_future)) =
                        (probs.p_now.last(), probs.p_future.last())
                    else {
                        continue;
                    };
                    let p_now = f64::from(p_now);
                    let p_future = f64::from(p_future);

                    // Scores always go out for visualization.
                    let score_iu = self.producer.make_iu(
                        Body::Score { p_now, p_future },
                        exchange::SCORE,
                        UpdateType::Add,
                    );
                    self.broker.publish(exchange::SCORE, &score_iu).await?;

                    let event = decide_event(p_now, p_future, prev_event, self.threshold);
                    if let Some(event) = event {
                        if Some(event) != prev_event {
                            debug!("n:{p_now:.3}, f:{p_future:.3}, {}", event.label());
                            let iu = self.producer.make_iu(
                                Body::Event { event, text: None },
                                exchange::VAP,
                                UpdateType::Add,
                            );
                            self.broker.publish(exchange::VAP, &iu).await?;
                            prev_event = Some(event);
                        }
                    }
                }
            }
        }

        info!("audio VAP shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn ring_buffer_shifts_oldest_out() {
        let mut ring = RingBuffer::new(4);
        ring.push(&[1.0, 2.0]);
        assert_eq!(ring.snapshot(), vec![0.0, 0.0, 1.0, 2.0]);
        ring.push(&[3.0, 4.0, 5.0]);
        assert_eq!(ring.snapshot(), vec![2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn oversized_chunk_keeps_the_tail() {
        let mut ring = RingBuffer::new(3);
        ring.push(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(ring.snapshot(), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn event_rule_matches_the_table() {
        let s = 0.6;
        // Both high: system takes the turn...
        assert_eq!(
            decide_event(0.9, 0.9, None, s),
            Some(TurnEvent::SystemTakeTurn)
        );
        // ...unless a backchannel was just suggested.
        assert_eq!(
            decide_event(0.9, 0.9, Some(TurnEvent::SystemBackchannel), s),
            None
        );
        // High now, low future, right after the user took the turn.
        assert_eq!(
            decide_event(0.9, 0.1, Some(TurnEvent::UserTakeTurn), s),
            Some(TurnEvent::SystemBackchannel)
        );
        assert_eq!(decide_event(0.9, 0.1, None, s), None);
        // Both low: user holds the turn.
        assert_eq!(
            decide_event(0.1, 0.2, Some(TurnEvent::SystemTakeTurn), s),
            Some(TurnEvent::UserTakeTurn)
        );
        // The undefined middle band emits nothing.
        assert_eq!(decide_event(0.9, 0.5, Some(TurnEvent::UserTakeTurn), s), None);
        assert_eq!(decide_event(0.5, 0.5, None, s), None);
    }

    #[test]
    fn pcm_decode_normalizes_to_unit_range() {
        let encoded = crate::test_utils::encode_pcm16(&[0, i16::MAX, i16::MIN]);
        let decoded = decode_chunk(&encoded).unwrap();
        assert_eq!(decoded.len(), 3);
        assert!(decoded[0].abs() < f32::EPSILON);
        assert!((decoded[1] - 0.99997).abs() < 1e-4);
        assert!((decoded[2] + 1.0).abs() < 1e-6);
    }
}
