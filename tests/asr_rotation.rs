//! ASR adapter behavior over the in-process bus with a scripted recognizer.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use colloquy::asr::{AsrAdapter, Snapshot};
use colloquy::broker::local::LocalBus;
use colloquy::broker::{exchange, Broker, Subscription};
use colloquy::config::AsrConfig;
use colloquy::iu::{Body, IuProducer, UpdateType};
use colloquy::test_utils::{encode_pcm16, ScriptedRecognizer};

fn interim(text: &str) -> Snapshot {
    Snapshot {
        transcript: text.to_owned(),
        stability: 0.4,
        confidence: 0.9,
        is_final: false,
    }
}

fn final_snapshot(text: &str) -> Snapshot {
    Snapshot {
        transcript: text.to_owned(),
        stability: 0.9,
        confidence: 0.95,
        is_final: true,
    }
}

async fn publish_audio(bus: &Arc<LocalBus>, producer: &IuProducer) {
    let mut iu = producer.make_iu(
        Body::Audio(encode_pcm16(&[0i16; 160])),
        exchange::AIN,
        UpdateType::Add,
    );
    iu.data_type = Some("audio".to_owned());
    bus.publish(exchange::AIN, &iu).await.unwrap();
}

async fn recv_asr(sub: &mut Subscription) -> (UpdateType, String) {
    let iu = tokio::time::timeout(Duration::from_secs(300), sub.recv())
        .await
        .expect("timed out waiting for asr IU")
        .expect("asr subscription closed");
    (
        iu.update_type,
        iu.body.as_text().unwrap_or_default().to_owned(),
    )
}

/// Scenario: continuous audio across the streaming cap. One rotation
/// happens, no REVOKEs are emitted, and the token sequence matches what a
/// single session would have produced.
#[tokio::test(start_paused = true)]
async fn session_rotation_is_seamless() {
    let bus = Arc::new(LocalBus::new(1024));
    let mut asr_sub = bus.subscribe(exchange::ASR).await.unwrap();

    let recognizer = Arc::new(ScriptedRecognizer::new(vec![
        vec![interim("the meeting is")],
        vec![final_snapshot("at noon")],
    ]));
    let config = AsrConfig {
        streaming_limit_secs: 240.0,
        ..Default::default()
    };
    let adapter = AsrAdapter::new(
        Arc::clone(&bus) as Arc<dyn Broker>,
        Arc::clone(&recognizer) as Arc<dyn colloquy::asr::Recognizer>,
        config,
    );
    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = adapter.run(run_cancel).await;
    });

    let mic = IuProducer::new("mic");
    publish_audio(&bus, &mic).await;

    // First session: three ADDs from the interim snapshot.
    for expected in ["the", "meeting", "is"] {
        let (kind, body) = recv_asr(&mut asr_sub).await;
        assert_eq!(kind, UpdateType::Add);
        assert_eq!(body, expected);
    }

    // Cross the streaming cap; the adapter rotates to a second session.
    tokio::time::sleep(Duration::from_secs(241)).await;
    publish_audio(&bus, &mic).await;

    // The fresh session's tokens continue the utterance; "at" is an ADD and
    // the final token rides the COMMIT. Nothing is revoked.
    let (kind, body) = recv_asr(&mut asr_sub).await;
    assert_eq!((kind, body.as_str()), (UpdateType::Add, "at"));
    let (kind, body) = recv_asr(&mut asr_sub).await;
    assert_eq!((kind, body.as_str()), (UpdateType::Commit, "noon"));

    assert!(recognizer.opened() >= 2, "expected a session rotation");
    cancel.cancel();
}

/// A shrinking final transcript revokes the dropped tail before committing.
#[tokio::test(start_paused = true)]
async fn corrected_transcript_revokes_before_commit() {
    let bus = Arc::new(LocalBus::new(1024));
    let mut asr_sub = bus.subscribe(exchange::ASR).await.unwrap();

    let recognizer = Arc::new(ScriptedRecognizer::new(vec![vec![
        interim("he lunched"),
        final_snapshot("he launched it"),
    ]]));
    let adapter = AsrAdapter::new(
        Arc::clone(&bus) as Arc<dyn Broker>,
        recognizer as Arc<dyn colloquy::asr::Recognizer>,
        AsrConfig::default(),
    );
    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = adapter.run(run_cancel).await;
    });

    let mic = IuProducer::new("mic");
    publish_audio(&bus, &mic).await;
    let (kind, body) = recv_asr(&mut asr_sub).await;
    assert_eq!((kind, body.as_str()), (UpdateType::Add, "he"));
    let (kind, body) = recv_asr(&mut asr_sub).await;
    assert_eq!((kind, body.as_str()), (UpdateType::Add, "lunched"));

    publish_audio(&bus, &mic).await;
    let (kind, body) = recv_asr(&mut asr_sub).await;
    assert_eq!((kind, body.as_str()), (UpdateType::Revoke, "lunched"));
    let (kind, body) = recv_asr(&mut asr_sub).await;
    assert_eq!((kind, body.as_str()), (UpdateType::Add, "launched"));
    let (kind, body) = recv_asr(&mut asr_sub).await;
    assert_eq!((kind, body.as_str()), (UpdateType::Commit, "it"));

    cancel.cancel();
}
