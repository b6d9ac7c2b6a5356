//! Incremental Unit (IU) envelope and stream utilities.
//!
//! Every message exchanged between modules is an IU: an ADD that contributes
//! to the current utterance, a REVOKE that withdraws a prior ADD by id, or a
//! COMMIT that closes the utterance on that exchange. The envelope carries a
//! producer tag, a monotonic timestamp, and an optional payload discriminator
//! so audio chunks survive the untyped wire format.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{CoreError, Result};

/// How an IU modifies the stream it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    /// Contribute new content to the current utterance.
    Add,
    /// Withdraw a previously added IU with the same id.
    Revoke,
    /// Close the current utterance; no further ADDs for it may follow.
    Commit,
}

/// Turn-taking event labels carried on the `vap` exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnEvent {
    /// The system should take the turn and respond.
    SystemTakeTurn,
    /// The system should produce a brief backchannel without taking the turn.
    SystemBackchannel,
    /// The user holds (or reclaims) the turn.
    UserTakeTurn,
    /// The user utterance is complete (recognizer COMMIT or silence timeout).
    AsrCommit,
    /// The system utterance has finished playing out.
    TtsCommit,
}

impl TurnEvent {
    /// Parse a wire label like `SYSTEM_TAKE_TURN`.
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "SYSTEM_TAKE_TURN" => Some(Self::SystemTakeTurn),
            "SYSTEM_BACKCHANNEL" => Some(Self::SystemBackchannel),
            "USER_TAKE_TURN" => Some(Self::UserTakeTurn),
            "ASR_COMMIT" => Some(Self::AsrCommit),
            "TTS_COMMIT" => Some(Self::TtsCommit),
            _ => None,
        }
    }

    /// The wire label for this event.
    pub fn label(self) -> &'static str {
        match self {
            Self::SystemTakeTurn => "SYSTEM_TAKE_TURN",
            Self::SystemBackchannel => "SYSTEM_BACKCHANNEL",
            Self::UserTakeTurn => "USER_TAKE_TURN",
            Self::AsrCommit => "ASR_COMMIT",
            Self::TtsCommit => "TTS_COMMIT",
        }
    }
}

/// Expression/action update published on `emo_act` and `dialogue2`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    /// Facial expression label (e.g. "joy"); absent when unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// Body action label (e.g. "nod"); absent when unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Free-form concept tag from the reaction classifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concept: Option<String>,
    /// The user text the reaction was produced for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_text: Option<String>,
}

/// Typed IU payload. On the wire this is the untyped `body` field; the
/// `data_type` envelope field disambiguates audio from plain text.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// A token, phrase, or turn-event label.
    Text(String),
    /// Base64-encoded 16-bit little-endian PCM.
    Audio(String),
    /// A turn event record, optionally carrying the final utterance text.
    Event {
        /// The event label.
        event: TurnEvent,
        /// Final accumulated text (silence-timeout ASR_COMMIT only).
        text: Option<String>,
    },
    /// Expression/action update.
    Reaction(Reaction),
    /// Audio VAP scores for visualization.
    Score {
        /// Probability the system should speak now.
        p_now: f64,
        /// Probability the system should speak in the near future.
        p_future: f64,
    },
}

impl Body {
    /// The string content of a `Text` body, if any.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Interpret this body as a turn event. Accepts both the bare-label
    /// and the record form used on the `vap` exchange.
    pub fn as_turn_event(&self) -> Option<(TurnEvent, Option<&str>)> {
        match self {
            Self::Event { event, text } => Some((*event, text.as_deref())),
            Self::Text(s) => TurnEvent::from_label(s).map(|e| (e, None)),
            _ => None,
        }
    }
}

/// The IU envelope exchanged between modules.
#[derive(Debug, Clone, PartialEq)]
pub struct IncrementalUnit {
    /// Seconds since the Unix epoch; non-decreasing per producer.
    pub timestamp: f64,
    /// Globally unique id. REVOKEs reuse the id of the IU they withdraw.
    pub id: String,
    /// Tag of the module that produced this IU.
    pub producer: String,
    /// ADD, REVOKE, or COMMIT.
    pub update_type: UpdateType,
    /// Exchange the IU was published on.
    pub exchange: String,
    /// Payload.
    pub body: Body,
    /// Payload discriminator (`audio`, `expression_and_action`, ...).
    pub data_type: Option<String>,
    /// Recognizer stability score, when applicable.
    pub stability: Option<f64>,
    /// Recognizer confidence score, when applicable.
    pub confidence: Option<f64>,
}

/// Wire representation with deterministic field names. Unknown fields are
/// tolerated on decode.
#[derive(Serialize, Deserialize)]
struct WireIu {
    timestamp: f64,
    id: String,
    producer: String,
    update_type: UpdateType,
    exchange: String,
    body: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stability: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    confidence: Option<f64>,
}

impl IncrementalUnit {
    /// Encode the envelope to its JSON wire form.
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        let body = match &self.body {
            Body::Text(s) | Body::Audio(s) => serde_json::Value::String(s.clone()),
            Body::Event { event, text } => match text {
                // Bare label when no text rides along, matching the
                // compact form consumers already accept.
                None => serde_json::Value::String(event.label().to_owned()),
                Some(t) => serde_json::json!({ "event": event, "text": t }),
            },
            Body::Reaction(r) => serde_json::to_value(r)
                .map_err(|e| CoreError::Protocol(format!("reaction encode: {e}")))?,
            Body::Score { p_now, p_future } => {
                serde_json::json!({ "p_now": p_now, "p_future": p_future })
            }
        };
        let wire = WireIu {
            timestamp: self.timestamp,
            id: self.id.clone(),
            producer: self.producer.clone(),
            update_type: self.update_type,
            exchange: self.exchange.clone(),
            body,
            data_type: self.data_type.clone(),
            stability: self.stability,
            confidence: self.confidence,
        };
        serde_json::to_vec(&wire).map_err(|e| CoreError::Protocol(format!("IU encode: {e}")))
    }

    /// Decode an envelope from its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Protocol`] for malformed envelopes or body shapes
    /// no consumer understands. Callers drop the IU and count the violation.
    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        let wire: WireIu = serde_json::from_slice(bytes)
            .map_err(|e| CoreError::Protocol(format!("malformed IU: {e}")))?;

        let body = match wire.body {
            serde_json::Value::String(s) => {
                if wire.data_type.as_deref() == Some("audio") {
                    Body::Audio(s)
                } else {
                    Body::Text(s)
                }
            }
            serde_json::Value::Object(map) => {
                if let Some(event) = map.get("event").and_then(|v| v.as_str()) {
                    let event = TurnEvent::from_label(event).ok_or_else(|| {
                        CoreError::Protocol(format!("unknown turn event: {event}"))
                    })?;
                    Body::Event {
                        event,
                        text: map.get("text").and_then(|v| v.as_str()).map(str::to_owned),
                    }
                } else if let (Some(p_now), Some(p_future)) = (
                    map.get("p_now").and_then(serde_json::Value::as_f64),
                    map.get("p_future").and_then(serde_json::Value::as_f64),
                ) {
                    Body::Score { p_now, p_future }
                } else {
                    let value = serde_json::Value::Object(map);
                    let reaction: Reaction = serde_json::from_value(value)
                        .map_err(|e| CoreError::Protocol(format!("unknown IU body: {e}")))?;
                    Body::Reaction(reaction)
                }
            }
            other => {
                return Err(CoreError::Protocol(format!(
                    "unsupported IU body type: {other}"
                )));
            }
        };

        Ok(Self {
            timestamp: wire.timestamp,
            id: wire.id,
            producer: wire.producer,
            update_type: wire.update_type,
            exchange: wire.exchange,
            body,
            data_type: wire.data_type,
            stability: wire.stability,
            confidence: wire.confidence,
        })
    }
}

/// Current wall-clock time as fractional seconds since the Unix epoch.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// IU factory bound to one producer tag.
///
/// Guarantees non-decreasing timestamps across all IUs it mints, even when
/// called from multiple tasks.
pub struct IuProducer {
    tag: String,
    last_timestamp: Mutex<f64>,
}

impl IuProducer {
    /// Create a factory for the given producer tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            last_timestamp: Mutex::new(0.0),
        }
    }

    /// The producer tag stamped on minted IUs.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Mint a fresh IU with a new id and a monotonic timestamp.
    pub fn make_iu(&self, body: Body, exchange: &str, kind: UpdateType) -> IncrementalUnit {
        let timestamp = {
            let mut last = self
                .last_timestamp
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let now = now_secs();
            *last = if now > *last { now } else { *last };
            *last
        };
        IncrementalUnit {
            timestamp,
            id: uuid::Uuid::new_v4().to_string(),
            producer: self.tag.clone(),
            update_type: kind,
            exchange: exchange.to_owned(),
            body,
            data_type: None,
            stability: None,
            confidence: None,
        }
    }
}

/// A REVOKE twin of `iu`: same id, same exchange, same body, fresh timestamp.
pub fn revoke_of(iu: &IncrementalUnit) -> IncrementalUnit {
    IncrementalUnit {
        timestamp: now_secs(),
        update_type: UpdateType::Revoke,
        ..iu.clone()
    }
}

/// Remove from `seq` every ADD whose id is REVOKEd later in the sequence,
/// along with the REVOKE markers themselves. Order is preserved.
pub fn compact(seq: &[IncrementalUnit]) -> Vec<IncrementalUnit> {
    let revoked: std::collections::HashSet<&str> = seq
        .iter()
        .filter(|iu| iu.update_type == UpdateType::Revoke)
        .map(|iu| iu.id.as_str())
        .collect();
    seq.iter()
        .filter(|iu| iu.update_type != UpdateType::Revoke && !revoked.contains(iu.id.as_str()))
        .cloned()
        .collect()
}

/// Join the text bodies of all non-REVOKEd IUs in `seq` with `spacer`.
pub fn concat_bodies(seq: &[IncrementalUnit], spacer: &str) -> String {
    compact(seq)
        .iter()
        .filter_map(|iu| iu.body.as_text())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(spacer)
}

/// Token-level diff between two recognition snapshots.
///
/// Returns `(revokes, adds)`: the diverging tail of `prev` to withdraw and
/// the new tail tokens to add. Retaining the common prefix of `prev`,
/// dropping `revokes`, and appending `adds` yields `new` token-for-token.
pub fn diff_tokens(prev: &[String], new: &[String]) -> (Vec<String>, Vec<String>) {
    let common = prev
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| a == b)
        .count();
    (prev[common..].to_vec(), new[common..].to_vec())
}
