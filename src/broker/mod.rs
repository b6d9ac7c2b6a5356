//! Pub/sub broker client.
//!
//! Modules communicate exclusively by exchanging IUs over named fan-out
//! exchanges: every subscriber receives every message, delivery is
//! at-most-once, nothing is durable, and per-subscriber ordering follows
//! publication order. Two implementations are provided: [`nats::NatsBroker`]
//! for one-module-per-process deployments and [`local::LocalBus`] for the
//! all-in-one binary and tests.

pub mod local;
pub mod nats;

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::Result;
use crate::iu::IncrementalUnit;

/// The fixed exchange set.
pub mod exchange {
    /// Microphone audio (base64 PCM chunks).
    pub const AIN: &str = "ain";
    /// Incremental recognition tokens.
    pub const ASR: &str = "asr";
    /// Turn events.
    pub const VAP: &str = "vap";
    /// VAP scores for the UI.
    pub const SCORE: &str = "score";
    /// Verbal backchannels.
    pub const BC: &str = "bc";
    /// Expression and action updates.
    pub const EMO_ACT: &str = "emo_act";
    /// System speech text.
    pub const DIALOGUE: &str = "dialogue";
    /// System nonverbal output.
    pub const DIALOGUE2: &str = "dialogue2";
    /// System audio chunks.
    pub const TTS: &str = "tts";

    /// All exchanges, for binding checks and diagnostics.
    pub const ALL: [&str; 9] = [
        AIN, ASR, VAP, SCORE, BC, EMO_ACT, DIALOGUE, DIALOGUE2, TTS,
    ];
}

static PROTOCOL_VIOLATIONS: AtomicU64 = AtomicU64::new(0);

/// Record a dropped IU that violated the protocol (malformed envelope,
/// unknown body shape). The offending message is not delivered.
pub fn record_protocol_violation(exchange: &str, detail: &str) {
    let total = PROTOCOL_VIOLATIONS.fetch_add(1, Ordering::Relaxed) + 1;
    warn!("dropping IU on '{exchange}': {detail} (total violations: {total})");
}

/// Number of protocol violations observed since startup.
pub fn protocol_violation_count() -> u64 {
    PROTOCOL_VIOLATIONS.load(Ordering::Relaxed)
}

/// A private, exclusive stream of IUs bound to one exchange.
///
/// Dropping the subscription unbinds the queue.
pub struct Subscription {
    rx: mpsc::Receiver<IncrementalUnit>,
}

impl Subscription {
    /// Wrap a receiver fed by a broker consumer task.
    pub(crate) fn new(rx: mpsc::Receiver<IncrementalUnit>) -> Self {
        Self { rx }
    }

    /// Receive the next IU, or `None` once the broker is closed.
    pub async fn recv(&mut self) -> Option<IncrementalUnit> {
        self.rx.recv().await
    }
}

/// Broker client contract shared by all transports.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish an IU to a fan-out exchange.
    ///
    /// Safe to call concurrently from multiple tasks. During a transport
    /// outage the call may drop the message with a structured warning once
    /// the reconnect grace period expires; it does not block indefinitely.
    async fn publish(&self, exchange: &str, iu: &IncrementalUnit) -> Result<()>;

    /// Bind a new private queue to `exchange` and stream its IUs.
    async fn subscribe(&self, exchange: &str) -> Result<Subscription>;

    /// Shut down the client. Idempotent.
    async fn close(&self) -> Result<()>;
}
