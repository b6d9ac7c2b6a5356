//! Dialogue manager.
//!
//! Owns the turn-taking state machine (`idle` → `listening` → `talking`),
//! launches speculative response attempts while the user is still speaking,
//! streams the chosen response out on `dialogue`/`dialogue2`, and handles
//! barge-in by revoking every in-flight output IU. All coordination happens
//! through the broker; the only shared state is the DM's own.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::{exchange, Broker};
use crate::config::{Config, DialogueConfig};
use crate::error::Result;
use crate::iu::{
    compact, concat_bodies, now_secs, revoke_of, Body, IncrementalUnit, IuProducer, Reaction,
    TurnEvent, UpdateType,
};
use crate::llm::respond::{
    Fragment, ResponseAttempt, ResponseGenerator, DEFAULT_ACTION, DEFAULT_EXPRESSION,
};
use crate::llm::ChatMessage;

/// Turn-taking state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogueState {
    /// Nobody holds the turn.
    Idle,
    /// A user utterance has been committed; waiting for turn-yield.
    Listening,
    /// The system is producing a response.
    Talking,
}

/// Events processed by the state loop, in enqueue order.
enum DmEvent {
    Turn {
        event: TurnEvent,
        text: Option<String>,
        timestamp: f64,
    },
    StreamFinished {
        user: Option<String>,
        response: String,
    },
}

/// State shared between the event loop and the response streaming task.
struct Shared {
    state: Mutex<DialogueState>,
    output_iu_buffer: Mutex<Vec<IncrementalUnit>>,
    history: Mutex<Vec<ChatMessage>>,
    system_utterance_end_time: Mutex<f64>,
    /// Bumped for every system turn; a streaming task whose turn number is
    /// stale must never publish again, even if the state returned to
    /// `talking` for a newer turn.
    turn_seq: std::sync::atomic::AtomicU64,
}

impl Shared {
    fn state(&self) -> DialogueState {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_state(&self, next: DialogueState) {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = next;
    }

    fn history_snapshot(&self) -> Vec<ChatMessage> {
        self.history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn end_time(&self) -> f64 {
        *self
            .system_utterance_end_time
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Keep at most `history_length` turns per side (2 × history_length entries),
/// dropping the oldest.
fn trim_history(history: &mut Vec<ChatMessage>, history_length: usize) {
    let max = history_length.saturating_mul(2);
    while history.len() > max {
        history.remove(0);
    }
}

/// Pick the attempt with the largest `asr_timestamp`, dropping (and thereby
/// cancelling) every other attempt. Returns whether any attempt failed.
fn select_freshest(
    attempts: Vec<crate::error::Result<ResponseAttempt>>,
) -> (Option<ResponseAttempt>, bool) {
    let mut selected: Option<ResponseAttempt> = None;
    let mut saw_error = false;
    for attempt in attempts {
        match attempt {
            Err(e) => {
                warn!("response attempt failed: {e}");
                saw_error = true;
            }
            Ok(attempt) => match &selected {
                Some(current) if attempt.asr_timestamp <= current.asr_timestamp => {
                    // Loser: dropping it releases the LLM stream.
                }
                _ => {
                    selected = Some(attempt);
                }
            },
        }
    }
    (selected, saw_error)
}

/// The dialogue manager module.
pub struct DialogueManager {
    broker: Arc<dyn Broker>,
    generator: Arc<ResponseGenerator>,
    config: DialogueConfig,
    llm_wait: Duration,
    producer: Arc<IuProducer>,
}

impl DialogueManager {
    /// Create the manager over a broker and a response generator.
    pub fn new(broker: Arc<dyn Broker>, generator: Arc<ResponseGenerator>, config: &Config) -> Self {
        Self {
            broker,
            generator,
            config: config.dialogue.clone(),
            llm_wait: Duration::from_secs_f64(config.timeout.llm_wait_secs.max(0.1)),
            producer: Arc::new(IuProducer::new("dialogue")),
        }
    }

    /// Run until cancelled.
    ///
    /// # Errors
    ///
    /// Returns broker subscription errors. Malformed upstream IUs never
    /// crash the manager; they are dropped and counted.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let shared = Arc::new(Shared {
            state: Mutex::new(DialogueState::Idle),
            output_iu_buffer: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            system_utterance_end_time: Mutex::new(0.0),
            turn_seq: std::sync::atomic::AtomicU64::new(0),
        });

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<DmEvent>();
        let (llm_tx, llm_rx) = mpsc::unbounded_channel::<Result<ResponseAttempt>>();
        let llm_rx = Arc::new(tokio::sync::Mutex::new(llm_rx));

        self.spawn_asr_consumer(&shared, &event_tx, &llm_tx, &cancel)
            .await?;
        self.spawn_vap_consumer(&event_tx, &cancel).await?;
        self.spawn_tts_consumer(&event_tx, &cancel).await?;
        self.spawn_bc_consumer(&event_tx, &cancel).await?;
        self.spawn_reaction_forwarder(&cancel).await?;

        info!("dialogue manager running");

        let mut stored_text: Option<String> = None;
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = event_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                DmEvent::StreamFinished { user, response } => {
                    let mut history = shared
                        .history
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    history.push(ChatMessage::new(
                        "user",
                        user.unwrap_or_else(|| "(silence)".to_owned()),
                    ));
                    history.push(ChatMessage::new("assistant", response));
                    trim_history(&mut history, self.config.history_length);
                }
                DmEvent::Turn {
                    event,
                    text,
                    timestamp,
                } => {
                    let prev = shared.state();
                    match event {
                        TurnEvent::TtsCommit => {
                            shared
                                .output_iu_buffer
                                .lock()
                                .unwrap_or_else(std::sync::PoisonError::into_inner)
                                .clear();
                            *shared
                                .system_utterance_end_time
                                .lock()
                                .unwrap_or_else(std::sync::PoisonError::into_inner) = timestamp;
                            shared.set_state(DialogueState::Idle);
                        }
                        TurnEvent::AsrCommit => {
                            // Reject commits that predate the end of the
                            // system's own utterance (echo of ourselves).
                            if timestamp <= shared.end_time() {
                                continue;
                            }
                            match prev {
                                DialogueState::Idle => {
                                    stored_text = text.or(stored_text.take());
                                    shared.set_state(DialogueState::Listening);
                                }
                                DialogueState::Listening => {
                                    stored_text = text.or(stored_text.take());
                                }
                                DialogueState::Talking => {
                                    // Barge-in: withdraw everything in flight
                                    // and listen to the new utterance.
                                    stop_response(&self.broker, &shared).await;
                                    stored_text = text;
                                    shared.set_state(DialogueState::Listening);
                                }
                            }
                        }
                        TurnEvent::SystemTakeTurn => {
                            if matches!(prev, DialogueState::Idle | DialogueState::Listening) {
                                shared.set_state(DialogueState::Talking);
                                self.spawn_response(
                                    &shared,
                                    &event_tx,
                                    &llm_tx,
                                    Arc::clone(&llm_rx),
                                    stored_text.take(),
                                );
                            }
                        }
                        TurnEvent::SystemBackchannel => {
                            if prev == DialogueState::Idle {
                                self.send_backchannel().await;
                            }
                        }
                        TurnEvent::UserTakeTurn => {}
                    }
                    info!(
                        "state: {prev:?} -> {:?} (trigger: {})",
                        shared.state(),
                        event.label()
                    );
                }
            }
        }

        info!("dialogue manager shut down");
        Ok(())
    }

    /// ASR consumer: rebuilds the user utterance from the incremental token
    /// stream, launches speculative response attempts, and turns recognizer
    /// COMMITs into `ASR_COMMIT` events.
    async fn spawn_asr_consumer(
        &self,
        shared: &Arc<Shared>,
        event_tx: &mpsc::UnboundedSender<DmEvent>,
        llm_tx: &mpsc::UnboundedSender<Result<ResponseAttempt>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut sub = self.broker.subscribe(exchange::ASR).await?;
        let shared = Arc::clone(shared);
        let event_tx = event_tx.clone();
        let llm_tx = llm_tx.clone();
        let generator = Arc::clone(&self.generator);
        let interval = self.config.response_generation_interval.max(1);
        let spacer = self.config.spacer.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let mut iu_memory: Vec<IncrementalUnit> = Vec::new();
            let mut new_iu_count = 0usize;
            loop {
                let iu = tokio::select! {
                    () = cancel.cancelled() => break,
                    iu = sub.recv() => match iu {
                        Some(iu) => iu,
                        None => break,
                    },
                };

                if iu.update_type == UpdateType::Revoke {
                    iu_memory.push(iu);
                    iu_memory = compact(&iu_memory);
                    continue;
                }

                iu_memory.push(iu.clone());
                let user_utterance = concat_bodies(&iu_memory, &spacer);
                if user_utterance.is_empty() {
                    if iu.update_type == UpdateType::Commit {
                        iu_memory.clear();
                    }
                    continue;
                }

                if iu.update_type == UpdateType::Add {
                    new_iu_count += 1;
                    if new_iu_count < interval {
                        continue;
                    }
                    new_iu_count = 0;
                }

                // Speculative launch: the attempt pushes itself into the
                // shared buffer as soon as its stream is ready.
                launch_attempt(
                    Arc::clone(&generator),
                    llm_tx.clone(),
                    iu.timestamp,
                    Some(user_utterance.clone()),
                    shared.history_snapshot(),
                );

                if iu.update_type == UpdateType::Commit {
                    if iu.timestamp > shared.end_time() {
                        let _ = event_tx.send(DmEvent::Turn {
                            event: TurnEvent::AsrCommit,
                            text: Some(user_utterance),
                            timestamp: iu.timestamp,
                        });
                    }
                    iu_memory.clear();
                    new_iu_count = 0;
                }
            }
        });
        Ok(())
    }

    async fn spawn_vap_consumer(
        &self,
        event_tx: &mpsc::UnboundedSender<DmEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut sub = self.broker.subscribe(exchange::VAP).await?;
        let event_tx = event_tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let iu = tokio::select! {
                    () = cancel.cancelled() => break,
                    iu = sub.recv() => match iu {
                        Some(iu) => iu,
                        None => break,
                    },
                };
                let Some((event, text)) = iu.body.as_turn_event() else {
                    crate::broker::record_protocol_violation(
                        exchange::VAP,
                        "body is not a turn event",
                    );
                    continue;
                };
                let _ = event_tx.send(DmEvent::Turn {
                    event,
                    text: text.map(str::to_owned),
                    timestamp: iu.timestamp,
                });
            }
        });
        Ok(())
    }

    async fn spawn_tts_consumer(
        &self,
        event_tx: &mpsc::UnboundedSender<DmEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut sub = self.broker.subscribe(exchange::TTS).await?;
        let event_tx = event_tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let iu = tokio::select! {
                    () = cancel.cancelled() => break,
                    iu = sub.recv() => match iu {
                        Some(iu) => iu,
                        None => break,
                    },
                };
                if iu.update_type == UpdateType::Commit {
                    let _ = event_tx.send(DmEvent::Turn {
                        event: TurnEvent::TtsCommit,
                        text: None,
                        timestamp: iu.timestamp,
                    });
                }
            }
        });
        Ok(())
    }

    async fn spawn_bc_consumer(
        &self,
        event_tx: &mpsc::UnboundedSender<DmEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut sub = self.broker.subscribe(exchange::BC).await?;
        let event_tx = event_tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let iu = tokio::select! {
                    () = cancel.cancelled() => break,
                    iu = sub.recv() => match iu {
                        Some(iu) => iu,
                        None => break,
                    },
                };
                let _ = event_tx.send(DmEvent::Turn {
                    event: TurnEvent::SystemBackchannel,
                    text: None,
                    timestamp: iu.timestamp,
                });
            }
        });
        Ok(())
    }

    /// Forward expression/action updates from the reaction detector to the
    /// avatar surface on `dialogue2`.
    async fn spawn_reaction_forwarder(&self, cancel: &CancellationToken) -> Result<()> {
        let mut sub = self.broker.subscribe(exchange::EMO_ACT).await?;
        let broker = Arc::clone(&self.broker);
        let producer = Arc::clone(&self.producer);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let iu = tokio::select! {
                    () = cancel.cancelled() => break,
                    iu = sub.recv() => match iu {
                        Some(iu) => iu,
                        None => break,
                    },
                };
                let Body::Reaction(reaction) = &iu.body else {
                    continue;
                };
                if reaction.expression.is_none() && reaction.action.is_none() {
                    continue;
                }
                let mut out = producer.make_iu(
                    Body::Reaction(Reaction {
                        expression: reaction.expression.clone(),
                        action: reaction.action.clone(),
                        concept: None,
                        current_text: None,
                    }),
                    exchange::DIALOGUE2,
                    UpdateType::Add,
                );
                out.data_type = Some("expression_and_action".to_owned());
                if let Err(e) = broker.publish(exchange::DIALOGUE2, &out).await {
                    warn!("reaction forward failed: {e}");
                }
            }
        });
        Ok(())
    }

    /// Spawn the response task for one system turn. Runs off the event loop
    /// so barge-in events keep flowing while the response streams.
    fn spawn_response(
        &self,
        shared: &Arc<Shared>,
        event_tx: &mpsc::UnboundedSender<DmEvent>,
        llm_tx: &mpsc::UnboundedSender<Result<ResponseAttempt>>,
        llm_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<ResponseAttempt>>>>,
        stored_text: Option<String>,
    ) {
        let broker = Arc::clone(&self.broker);
        let generator = Arc::clone(&self.generator);
        let producer = Arc::clone(&self.producer);
        let shared = Arc::clone(shared);
        let event_tx = event_tx.clone();
        let llm_tx = llm_tx.clone();
        let llm_wait = self.llm_wait;
        let default_phrase = self.config.default_phrase.clone();
        let apology_phrase = self.config.apology_phrase.clone();
        let turn = shared
            .turn_seq
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;

        tokio::spawn(async move {
            let mut rx = llm_rx.lock().await;

            // Drain every attempt that is already ready.
            let mut ready = Vec::new();
            while let Ok(attempt) = rx.try_recv() {
                ready.push(attempt);
            }
            let (mut selected, mut saw_error) = select_freshest(ready);

            if selected.is_none() {
                // Nothing speculative is ready: launch a fresh attempt for
                // the stored text (or a self-initiated turn) and wait,
                // bounded.
                launch_attempt(
                    Arc::clone(&generator),
                    llm_tx.clone(),
                    now_secs(),
                    stored_text.clone(),
                    shared.history_snapshot(),
                );
                match tokio::time::timeout(llm_wait, rx.recv()).await {
                    Ok(Some(first)) => {
                        let mut arrived = vec![first];
                        while let Ok(more) = rx.try_recv() {
                            arrived.push(more);
                        }
                        let (fresh, err) = select_freshest(arrived);
                        selected = fresh;
                        saw_error = saw_error || err;
                    }
                    Ok(None) => return,
                    Err(_) => {
                        warn!("no response stream within {llm_wait:?}; using default phrase");
                    }
                }
            }
            drop(rx);

            let ctx = StreamContext {
                broker,
                producer,
                shared,
                event_tx,
                turn,
            };
            match selected {
                Some(attempt) => stream_response(ctx, attempt, &apology_phrase).await,
                None => {
                    // Timeout or catastrophic failure: preserve turn
                    // semantics with a canned phrase and a COMMIT.
                    let phrase = if saw_error {
                        &apology_phrase
                    } else {
                        &default_phrase
                    };
                    publish_canned_turn(&ctx, stored_text, phrase).await;
                }
            }
        });
    }

    async fn send_backchannel(&self) {
        use rand::seq::SliceRandom as _;
        let Some(bc) = self
            .config
            .backchannels
            .choose(&mut rand::thread_rng())
            .cloned()
        else {
            return;
        };
        let iu = self
            .producer
            .make_iu(Body::Text(bc), exchange::DIALOGUE, UpdateType::Add);
        if let Err(e) = self.broker.publish(exchange::DIALOGUE, &iu).await {
            warn!("backchannel publish failed: {e}");
        }
    }
}

/// Everything the streaming task needs to publish a turn.
struct StreamContext {
    broker: Arc<dyn Broker>,
    producer: Arc<IuProducer>,
    shared: Arc<Shared>,
    event_tx: mpsc::UnboundedSender<DmEvent>,
    turn: u64,
}

impl StreamContext {
    /// Whether this task's turn is still the one being spoken.
    fn still_active(&self) -> bool {
        self.shared.state() == DialogueState::Talking
            && self
                .shared
                .turn_seq
                .load(std::sync::atomic::Ordering::SeqCst)
                == self.turn
    }
}

/// Launch one speculative attempt; it lands in `llm_tx` when its stream is
/// open (or an error if the provider refused).
fn launch_attempt(
    generator: Arc<ResponseGenerator>,
    llm_tx: mpsc::UnboundedSender<Result<ResponseAttempt>>,
    asr_timestamp: f64,
    user_utterance: Option<String>,
    history: Vec<ChatMessage>,
) {
    tokio::spawn(async move {
        let attempt = generator
            .generate(asr_timestamp, user_utterance, &history)
            .await;
        let _ = llm_tx.send(attempt);
    });
}

/// Stream the chosen attempt out on `dialogue`/`dialogue2` until it ends or
/// the state leaves `talking`.
async fn stream_response(ctx: StreamContext, attempt: ResponseAttempt, apology_phrase: &str) {
    let ResponseAttempt {
        user_utterance,
        mut stream,
        ..
    } = attempt;
    let mut joined_phrases = String::new();

    while let Some(fragment) = stream.next().await {
        if !ctx.still_active() {
            abandon_stream(&ctx).await;
            return;
        }
        match fragment {
            Fragment::Phrase(phrase) => {
                let phrase = phrase.replace('/', "");
                if phrase.is_empty() {
                    continue;
                }
                let iu =
                    ctx.producer
                        .make_iu(Body::Text(phrase.clone()), exchange::DIALOGUE, UpdateType::Add);
                ctx.shared
                    .output_iu_buffer
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push(iu.clone());
                if let Err(e) = ctx.broker.publish(exchange::DIALOGUE, &iu).await {
                    warn!("response publish failed: {e}");
                }
                joined_phrases.push_str(&phrase);
            }
            Fragment::ExpressionAction { expression, action } => {
                let expression = (expression != DEFAULT_EXPRESSION).then_some(expression);
                let action = (action != DEFAULT_ACTION).then_some(action);
                if expression.is_none() && action.is_none() {
                    continue;
                }
                let mut iu = ctx.producer.make_iu(
                    Body::Reaction(Reaction {
                        expression,
                        action,
                        concept: None,
                        current_text: None,
                    }),
                    exchange::DIALOGUE2,
                    UpdateType::Add,
                );
                iu.data_type = Some("expression_and_action".to_owned());
                ctx.shared
                    .output_iu_buffer
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push(iu.clone());
                if let Err(e) = ctx.broker.publish(exchange::DIALOGUE2, &iu).await {
                    warn!("reaction publish failed: {e}");
                }
            }
        }
    }

    if !ctx.still_active() {
        abandon_stream(&ctx).await;
        return;
    }

    if joined_phrases.is_empty() && stream.failed() {
        // The provider died before producing anything audible.
        publish_canned_turn(&ctx, user_utterance, apology_phrase).await;
        return;
    }

    finish_turn(&ctx, user_utterance, joined_phrases).await;
}

/// A streaming task whose turn was interrupted (barge-in) withdraws what
/// the state loop has not already revoked; one whose turn was superseded
/// must not touch the newer turn's buffer.
async fn abandon_stream(ctx: &StreamContext) {
    let interrupted_own_turn = ctx
        .shared
        .turn_seq
        .load(std::sync::atomic::Ordering::SeqCst)
        == ctx.turn;
    if interrupted_own_turn {
        stop_response(&ctx.broker, &ctx.shared).await;
    }
}

/// Publish a canned single-phrase turn (default phrase or apology), keeping
/// turn semantics intact with a trailing COMMIT.
async fn publish_canned_turn(ctx: &StreamContext, user: Option<String>, phrase: &str) {
    if !ctx.still_active() {
        return;
    }
    let iu = ctx.producer.make_iu(
        Body::Text(phrase.to_owned()),
        exchange::DIALOGUE,
        UpdateType::Add,
    );
    ctx.shared
        .output_iu_buffer
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .push(iu.clone());
    if let Err(e) = ctx.broker.publish(exchange::DIALOGUE, &iu).await {
        warn!("fallback publish failed: {e}");
    }
    finish_turn(ctx, user, phrase.to_owned()).await;
}

/// End-of-stream bookkeeping: COMMIT on `dialogue` and a history record.
async fn finish_turn(ctx: &StreamContext, user: Option<String>, joined_phrases: String) {
    let commit =
        ctx.producer
            .make_iu(Body::Text(String::new()), exchange::DIALOGUE, UpdateType::Commit);
    if let Err(e) = ctx.broker.publish(exchange::DIALOGUE, &commit).await {
        warn!("commit publish failed: {e}");
    }
    let _ = ctx.event_tx.send(DmEvent::StreamFinished {
        user,
        response: joined_phrases,
    });
}

/// Withdraw every in-flight output IU (barge-in). Idempotent: a second call
/// finds the buffer empty.
async fn stop_response(broker: &Arc<dyn Broker>, shared: &Arc<Shared>) {
    let drained: Vec<IncrementalUnit> = {
        let mut buffer = shared
            .output_iu_buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        buffer.drain(..).collect()
    };
    for iu in drained {
        let revoke = revoke_of(&iu);
        if let Err(e) = broker.publish(&revoke.exchange, &revoke).await {
            warn!("revoke publish failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::LlmConfig;
    use crate::llm::prompts::Prompts;
    use crate::test_utils::ScriptedChat;

    #[test]
    fn history_never_exceeds_twice_history_length() {
        let mut history = Vec::new();
        for i in 0..30 {
            history.push(ChatMessage::new("user", format!("u{i}")));
            history.push(ChatMessage::new("assistant", format!("a{i}")));
            trim_history(&mut history, 10);
            assert!(history.len() <= 20);
        }
        // Oldest entries fall off first.
        assert_eq!(history[0].content, "u20");
    }

    #[tokio::test]
    async fn freshest_attempt_wins_selection() {
        let backend: Arc<dyn crate::llm::ChatBackend> =
            Arc::new(ScriptedChat::with_tokens(&["ok", "/"]));
        let generator = ResponseGenerator::new(
            backend,
            LlmConfig::default(),
            Prompts::default(),
        );

        // Attempts launched at t=0.10 and t=0.40 (scenario: ADD "when",
        // ADD "is", ADD "lunch").
        let early = generator
            .generate(0.10, Some("when".to_owned()), &[])
            .await
            .unwrap();
        let late = generator
            .generate(0.40, Some("when is lunch".to_owned()), &[])
            .await
            .unwrap();

        let (selected, saw_error) = select_freshest(vec![Ok(early), Ok(late)]);
        let selected = selected.unwrap();
        assert!(!saw_error);
        assert_eq!(selected.asr_timestamp, 0.40);
        assert_eq!(selected.user_utterance.as_deref(), Some("when is lunch"));
    }

    #[tokio::test]
    async fn selection_reports_failed_attempts() {
        let (selected, saw_error) = select_freshest(vec![Err(
            crate::error::CoreError::Llm("down".to_owned()),
        )]);
        assert!(selected.is_none());
        assert!(saw_error);
    }
}
