//! End-to-end turn-taking scenarios over the in-process bus.
//!
//! Modules are spawned exactly as the runtime wires them, with scripted
//! collaborators standing in for the chat provider and synthesis engine.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use colloquy::broker::local::LocalBus;
use colloquy::broker::{exchange, Broker, Subscription};
use colloquy::config::Config;
use colloquy::dialogue::DialogueManager;
use colloquy::iu::{Body, IncrementalUnit, IuProducer, TurnEvent, UpdateType};
use colloquy::llm::prompts::Prompts;
use colloquy::llm::respond::ResponseGenerator;
use colloquy::test_utils::{ChatScript, ScriptedChat};
use colloquy::tts::{SineSynthesizer, TtsPipeline};
use colloquy::vap::text::TextVap;

fn fast_config() -> Config {
    let mut config = Config::default();
    config.tts.org_sample_rate = 16_000;
    config.tts.dst_sample_rate = 16_000;
    config.tts.frame_length = 0.05;
    config.tts.send_interval = 0.0;
    config
}

fn spawn_dialogue(bus: &Arc<LocalBus>, chat: Arc<ScriptedChat>, config: &Config) {
    let generator = Arc::new(ResponseGenerator::new(
        chat,
        config.llm.clone(),
        Prompts::default(),
    ));
    let manager = DialogueManager::new(
        Arc::clone(bus) as Arc<dyn Broker>,
        generator,
        config,
    );
    let cancel = CancellationToken::new();
    tokio::spawn(async move {
        let _ = manager.run(cancel).await;
    });
}

fn spawn_text_vap(bus: &Arc<LocalBus>, chat: Arc<ScriptedChat>, config: &Config) {
    let text_vap = TextVap::new(
        Arc::clone(bus) as Arc<dyn Broker>,
        chat,
        config,
        Prompts::default(),
    );
    let cancel = CancellationToken::new();
    tokio::spawn(async move {
        let _ = text_vap.run(cancel).await;
    });
}

fn spawn_tts(bus: &Arc<LocalBus>, config: &Config) {
    let pipeline = TtsPipeline::new(
        Arc::clone(bus) as Arc<dyn Broker>,
        Arc::new(SineSynthesizer::new(config.tts.org_sample_rate)),
        &config.tts,
    );
    let cancel = CancellationToken::new();
    tokio::spawn(async move {
        let _ = pipeline.run(cancel).await;
    });
}

/// Park until all spawned module tasks have bound their subscriptions.
/// Under the paused clock this only returns once every task is idle, so no
/// subsequently published IU can be lost to the fan-out.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

async fn recv_iu(sub: &mut Subscription) -> IncrementalUnit {
    tokio::time::timeout(Duration::from_secs(60), sub.recv())
        .await
        .expect("timed out waiting for IU")
        .expect("subscription closed")
}

fn neutral_classifier() -> Arc<ScriptedChat> {
    Arc::new(ScriptedChat::with_tokens(&[
        "a:\n", "b: normal\n", "c: wait\n", "d: 0",
    ]))
}

fn vap_event(producer: &IuProducer, event: TurnEvent, text: Option<&str>) -> IncrementalUnit {
    producer.make_iu(
        Body::Event {
            event,
            text: text.map(str::to_owned),
        },
        exchange::VAP,
        UpdateType::Add,
    )
}

/// Scenario: ASR commits "hi there"; the system takes the turn, speaks, and
/// returns to idle.
#[tokio::test(start_paused = true)]
async fn basic_turn_flows_through_dialogue_and_tts() {
    let config = fast_config();
    let bus = Arc::new(LocalBus::new(4096));
    let mut vap_sub = bus.subscribe(exchange::VAP).await.unwrap();
    let mut dialogue_sub = bus.subscribe(exchange::DIALOGUE).await.unwrap();
    let mut tts_sub = bus.subscribe(exchange::TTS).await.unwrap();

    spawn_text_vap(&bus, neutral_classifier(), &config);
    spawn_dialogue(
        &bus,
        Arc::new(ScriptedChat::with_tokens(&["Hi", " there", "."])),
        &config,
    );
    spawn_tts(&bus, &config);
    settle().await;

    // The user says "hi there" and the recognizer commits.
    let asr = IuProducer::new("asr");
    for token in ["hi", "there"] {
        let iu = asr.make_iu(Body::Text(token.to_owned()), exchange::ASR, UpdateType::Add);
        bus.publish(exchange::ASR, &iu).await.unwrap();
    }
    let commit = asr.make_iu(Body::Text(String::new()), exchange::ASR, UpdateType::Commit);
    bus.publish(exchange::ASR, &commit).await.unwrap();

    // Text-VAP closes the utterance and yields the turn.
    let iu = recv_iu(&mut vap_sub).await;
    assert_eq!(
        iu.body.as_turn_event(),
        Some((TurnEvent::AsrCommit, Some("hi there")))
    );
    let iu = recv_iu(&mut vap_sub).await;
    assert_eq!(iu.body.as_turn_event(), Some((TurnEvent::SystemTakeTurn, None)));

    // The dialogue manager streams the response and commits.
    let iu = recv_iu(&mut dialogue_sub).await;
    assert_eq!(iu.update_type, UpdateType::Add);
    assert_eq!(iu.body.as_text(), Some("Hi there."));
    let iu = recv_iu(&mut dialogue_sub).await;
    assert_eq!(iu.update_type, UpdateType::Commit);

    // TTS publishes at least one audio chunk, then a COMMIT.
    let mut saw_audio = false;
    loop {
        let iu = recv_iu(&mut tts_sub).await;
        match iu.update_type {
            UpdateType::Add => {
                assert!(matches!(iu.body, Body::Audio(_)));
                saw_audio = true;
            }
            UpdateType::Commit => break,
            UpdateType::Revoke => panic!("unexpected revoke on tts"),
        }
    }
    assert!(saw_audio);

    // Back in idle: a backchannel request is honored (it is ignored in any
    // other state).
    tokio::time::sleep(Duration::from_millis(200)).await;
    let bc = IuProducer::new("audio_vap");
    let iu = bc.make_iu(Body::Text("uh-huh".to_owned()), exchange::BC, UpdateType::Add);
    bus.publish(exchange::BC, &iu).await.unwrap();
    let iu = recv_iu(&mut dialogue_sub).await;
    assert_eq!(iu.update_type, UpdateType::Add);
    let text = iu.body.as_text().unwrap().to_owned();
    assert!(config.dialogue.backchannels.contains(&text), "got {text}");
}

/// Scenario: the user says "hello" and falls silent; Text-VAP auto-commits
/// after `max_silence_time` and the system responds.
#[tokio::test(start_paused = true)]
async fn silence_auto_commit_drives_a_response() {
    let config = Config::default();
    let bus = Arc::new(LocalBus::new(1024));
    let mut vap_sub = bus.subscribe(exchange::VAP).await.unwrap();
    let mut dialogue_sub = bus.subscribe(exchange::DIALOGUE).await.unwrap();

    spawn_text_vap(&bus, neutral_classifier(), &config);
    spawn_dialogue(
        &bus,
        Arc::new(ScriptedChat::with_tokens(&["Hello", " to", " you", "."])),
        &config,
    );
    settle().await;

    let asr = IuProducer::new("asr");
    let iu = asr.make_iu(Body::Text("hello".to_owned()), exchange::ASR, UpdateType::Add);
    bus.publish(exchange::ASR, &iu).await.unwrap();

    // No COMMIT ever arrives; the silence watch fires at t+3s.
    let iu = recv_iu(&mut vap_sub).await;
    assert_eq!(
        iu.body.as_turn_event(),
        Some((TurnEvent::AsrCommit, Some("hello")))
    );
    let iu = recv_iu(&mut vap_sub).await;
    assert_eq!(iu.body.as_turn_event(), Some((TurnEvent::SystemTakeTurn, None)));

    let iu = recv_iu(&mut dialogue_sub).await;
    assert_eq!(iu.body.as_text(), Some("Hello to you."));
    let iu = recv_iu(&mut dialogue_sub).await;
    assert_eq!(iu.update_type, UpdateType::Commit);
}

/// Scenario: the user barges in mid-response; every in-flight `dialogue`
/// ADD is revoked, TTS flushes with a COMMIT, and the next turn answers the
/// new utterance.
#[tokio::test(start_paused = true)]
async fn barge_in_revokes_output_and_flushes_tts() {
    let config = fast_config();
    let bus = Arc::new(LocalBus::new(4096));
    let mut dialogue_sub = bus.subscribe(exchange::DIALOGUE).await.unwrap();
    let mut tts_sub = bus.subscribe(exchange::TTS).await.unwrap();

    // First response streams two phrases and then stalls (never commits).
    let chat = Arc::new(ScriptedChat::new(ChatScript::Tokens(vec![
        "Okay".to_owned(),
        ".".to_owned(),
    ])));
    chat.push_script(ChatScript::TokensThenHang(vec![
        "First phrase. ".to_owned(),
        "Second phrase. ".to_owned(),
    ]));
    spawn_dialogue(&bus, chat, &config);
    spawn_tts(&bus, &config);
    settle().await;

    let vap = IuProducer::new("text_vap");
    bus.publish(
        exchange::VAP,
        &vap_event(&vap, TurnEvent::AsrCommit, Some("tell me a story")),
    )
    .await
    .unwrap();
    bus.publish(
        exchange::VAP,
        &vap_event(&vap, TurnEvent::SystemTakeTurn, None),
    )
    .await
    .unwrap();

    // Two phrases go out; the turn is still open.
    let a = recv_iu(&mut dialogue_sub).await;
    assert_eq!(a.update_type, UpdateType::Add);
    let b = recv_iu(&mut dialogue_sub).await;
    assert_eq!(b.update_type, UpdateType::Add);

    // Barge-in: a new user utterance is committed while talking.
    bus.publish(
        exchange::VAP,
        &vap_event(&vap, TurnEvent::AsrCommit, Some("actually stop")),
    )
    .await
    .unwrap();

    // Both in-flight ADDs are revoked, in publication order.
    let r1 = recv_iu(&mut dialogue_sub).await;
    assert_eq!(r1.update_type, UpdateType::Revoke);
    assert_eq!(r1.id, a.id);
    let r2 = recv_iu(&mut dialogue_sub).await;
    assert_eq!(r2.update_type, UpdateType::Revoke);
    assert_eq!(r2.id, b.id);

    // TTS drops its backlog and closes the stream.
    loop {
        let iu = recv_iu(&mut tts_sub).await;
        if iu.update_type == UpdateType::Commit {
            break;
        }
    }

    // The next turn-yield answers the new utterance.
    bus.publish(
        exchange::VAP,
        &vap_event(&vap, TurnEvent::SystemTakeTurn, None),
    )
    .await
    .unwrap();
    let iu = recv_iu(&mut dialogue_sub).await;
    assert_eq!(iu.body.as_text(), Some("Okay."));
}

/// Scenario: speculative attempts launched at t=0.10 and t=0.40; at
/// turn-yield the freshest (t=0.40) wins.
#[tokio::test(start_paused = true)]
async fn speculative_selection_picks_the_freshest_attempt() {
    let mut config = Config::default();
    config.dialogue.response_generation_interval = 1;
    let bus = Arc::new(LocalBus::new(1024));
    let mut dialogue_sub = bus.subscribe(exchange::DIALOGUE).await.unwrap();

    spawn_dialogue(&bus, Arc::new(ScriptedChat::new(ChatScript::EchoUser)), &config);
    settle().await;

    // Hand-crafted ASR ADDs with explicit timestamps.
    for (timestamp, token) in [(0.10, "when"), (0.25, "is"), (0.40, "lunch")] {
        let iu = IncrementalUnit {
            timestamp,
            id: format!("asr-{token}"),
            producer: "asr".to_owned(),
            update_type: UpdateType::Add,
            exchange: exchange::ASR.to_owned(),
            body: Body::Text(token.to_owned()),
            data_type: None,
            stability: Some(0.0),
            confidence: Some(0.99),
        };
        bus.publish(exchange::ASR, &iu).await.unwrap();
    }

    // Let every attempt open its stream and register itself.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let vap = IuProducer::new("audio_vap");
    bus.publish(
        exchange::VAP,
        &vap_event(&vap, TurnEvent::SystemTakeTurn, None),
    )
    .await
    .unwrap();

    // The echoed response proves the freshest utterance won.
    let iu = recv_iu(&mut dialogue_sub).await;
    assert_eq!(iu.update_type, UpdateType::Add);
    assert_eq!(iu.body.as_text(), Some("when is lunch"));
    let iu = recv_iu(&mut dialogue_sub).await;
    assert_eq!(iu.update_type, UpdateType::Commit);
}

/// The dialogue manager falls back to the default phrase when no response
/// stream opens within the configured wait.
#[tokio::test(start_paused = true)]
async fn llm_timeout_falls_back_to_default_phrase() {
    let mut config = Config::default();
    config.timeout.llm_wait_secs = 2.0;
    let bus = Arc::new(LocalBus::new(1024));
    let mut dialogue_sub = bus.subscribe(exchange::DIALOGUE).await.unwrap();

    spawn_dialogue(&bus, Arc::new(ScriptedChat::new(ChatScript::StallOpen)), &config);
    settle().await;

    let vap = IuProducer::new("text_vap");
    bus.publish(
        exchange::VAP,
        &vap_event(&vap, TurnEvent::AsrCommit, Some("anyone there")),
    )
    .await
    .unwrap();
    bus.publish(
        exchange::VAP,
        &vap_event(&vap, TurnEvent::SystemTakeTurn, None),
    )
    .await
    .unwrap();

    let iu = recv_iu(&mut dialogue_sub).await;
    assert_eq!(iu.body.as_text(), Some(config.dialogue.default_phrase.as_str()));
    let iu = recv_iu(&mut dialogue_sub).await;
    assert_eq!(iu.update_type, UpdateType::Commit);
}

/// On catastrophic LLM failure the manager apologizes and still commits,
/// preserving turn semantics.
#[tokio::test(start_paused = true)]
async fn llm_failure_emits_apology_and_commit() {
    let config = Config::default();
    let bus = Arc::new(LocalBus::new(1024));
    let mut dialogue_sub = bus.subscribe(exchange::DIALOGUE).await.unwrap();

    spawn_dialogue(&bus, Arc::new(ScriptedChat::new(ChatScript::Fail)), &config);
    settle().await;

    let vap = IuProducer::new("text_vap");
    bus.publish(
        exchange::VAP,
        &vap_event(&vap, TurnEvent::AsrCommit, Some("hello")),
    )
    .await
    .unwrap();
    bus.publish(
        exchange::VAP,
        &vap_event(&vap, TurnEvent::SystemTakeTurn, None),
    )
    .await
    .unwrap();

    let iu = recv_iu(&mut dialogue_sub).await;
    assert_eq!(iu.body.as_text(), Some(config.dialogue.apology_phrase.as_str()));
    let iu = recv_iu(&mut dialogue_sub).await;
    assert_eq!(iu.update_type, UpdateType::Commit);
}

/// Stale recognizer commits (timestamped before the system finished its own
/// utterance) are rejected; the manager stays idle.
#[tokio::test(start_paused = true)]
async fn stale_commit_is_rejected_after_system_utterance() {
    let config = Config::default();
    let bus = Arc::new(LocalBus::new(1024));
    let mut dialogue_sub = bus.subscribe(exchange::DIALOGUE).await.unwrap();

    spawn_dialogue(
        &bus,
        Arc::new(ScriptedChat::new(ChatScript::EchoUser)),
        &config,
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The system just finished speaking at a wall-clock far in the future.
    let far_future = colloquy::iu::now_secs() + 1_000.0;
    let tts = IuProducer::new("tts");
    let mut commit = tts.make_iu(Body::Text(String::new()), exchange::TTS, UpdateType::Commit);
    commit.timestamp = far_future;
    bus.publish(exchange::TTS, &commit).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // An echo of that utterance comes back through the recognizer with an
    // older timestamp: it must not start a turn.
    let vap = IuProducer::new("text_vap");
    let mut echo = vap_event(&vap, TurnEvent::AsrCommit, Some("echo of myself"));
    echo.timestamp = far_future - 1.0;
    bus.publish(exchange::VAP, &echo).await.unwrap();
    bus.publish(
        exchange::VAP,
        &vap_event(&vap, TurnEvent::SystemTakeTurn, None),
    )
    .await
    .unwrap();

    // The turn is self-initiated ("(silence)"), not a response to the echo.
    let iu = recv_iu(&mut dialogue_sub).await;
    assert_ne!(iu.body.as_text(), Some("echo of myself"));
}
