//! Text-based turn predictor and reaction generator.
//!
//! Watches the incremental transcript on `asr`, asks an LLM classifier for
//! backchannels, expression/action updates, and a turn-yield score, and owns
//! the silence-timeout committer: when the user stops producing tokens for
//! `max_silence_time`, the accumulated text is committed on behalf of the
//! recognizer and the system takes the turn.
//!
//! The classifier prompt asks for four labelled lines:
//! `a:` verbal backchannel, `b:` expression, `c:` action, `d:` turn-yield
//! score 0-10.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{exchange, Broker};
use crate::config::{Config, LlmConfig, TextVapConfig};
use crate::error::Result;
use crate::iu::{Body, IuProducer, Reaction, TurnEvent, UpdateType};
use crate::llm::prompts::Prompts;
use crate::llm::respond::{DEFAULT_ACTION, DEFAULT_EXPRESSION};
use crate::llm::{ChatBackend, ChatMessage};

/// Parsed classifier output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReactionOutcome {
    /// Verbal backchannel suggestion (`a:`).
    pub backchannel: Option<String>,
    /// Expression label (`b:`).
    pub expression: Option<String>,
    /// Action label (`c:`).
    pub action: Option<String>,
    /// Turn-yield score 0-10 (`d:`).
    pub score: Option<u8>,
}

/// Parse the four labelled lines of a classifier completion. Missing or
/// malformed lines simply yield `None` for that slot.
pub fn parse_reaction(completion: &str) -> ReactionOutcome {
    let mut outcome = ReactionOutcome::default();
    for line in completion.lines() {
        let line = line.trim();
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match label.trim().to_ascii_lowercase().as_str() {
            "a" => {
                if !value.is_empty() {
                    outcome.backchannel = Some(value.to_owned());
                }
            }
            "b" => {
                if !value.is_empty() {
                    outcome.expression = Some(value.to_owned());
                }
            }
            "c" => {
                if !value.is_empty() {
                    outcome.action = Some(value.to_owned());
                }
            }
            "d" => {
                outcome.score = value
                    .split(|c: char| !c.is_ascii_digit())
                    .find(|s| !s.is_empty())
                    .and_then(|digits| digits.parse().ok());
            }
            _ => {}
        }
    }
    outcome
}

/// Mutable per-utterance state of the Text VAP loop.
struct Accumulator {
    text: String,
    adds_since_classify: usize,
    verbal_used: usize,
    nonverbal_used: usize,
    utterance_active: bool,
    last_committed_text: Option<String>,
    current_expression: String,
    current_action: String,
    /// Invalidates in-flight classifier calls from an earlier utterance.
    generation: u64,
    deadline: Option<tokio::time::Instant>,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            text: String::new(),
            adds_since_classify: 0,
            verbal_used: 0,
            nonverbal_used: 0,
            utterance_active: false,
            last_committed_text: None,
            current_expression: DEFAULT_EXPRESSION.to_owned(),
            current_action: DEFAULT_ACTION.to_owned(),
            generation: 0,
            deadline: None,
        }
    }

    fn reset_input(&mut self) {
        self.text.clear();
        self.adds_since_classify = 0;
        self.utterance_active = false;
        self.deadline = None;
        self.generation += 1;
    }
}

/// The Text VAP module.
pub struct TextVap {
    broker: Arc<dyn Broker>,
    backend: Arc<dyn ChatBackend>,
    config: TextVapConfig,
    llm: LlmConfig,
    prompts: Prompts,
    max_silence: Duration,
    producer: IuProducer,
}

impl TextVap {
    /// Create the module over a broker and a chat backend.
    pub fn new(
        broker: Arc<dyn Broker>,
        backend: Arc<dyn ChatBackend>,
        config: &Config,
        prompts: Prompts,
    ) -> Self {
        Self {
            broker,
            backend,
            config: config.text_vap.clone(),
            llm: config.llm.clone(),
            prompts,
            max_silence: Duration::from_secs_f64(config.timeout.max_silence_time.max(0.1)),
            producer: IuProducer::new("text_vap"),
        }
    }

    /// Run until cancelled.
    ///
    /// # Errors
    ///
    /// Returns broker errors; classifier failures are logged and skipped.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut sub = self.broker.subscribe(exchange::ASR).await?;
        let (outcome_tx, mut outcome_rx) = mpsc::channel::<(u64, ReactionOutcome)>(16);
        let mut acc = Accumulator::new();

        info!(
            "text VAP running (interval {}, silence {:.1}s)",
            self.config.text_vap_interval,
            self.max_silence.as_secs_f64()
        );

        loop {
            // A single conditional sleep arm keeps exactly one silence watch
            // armed whenever the accumulator is non-empty.
            let deadline = acc.deadline;
            let silence = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => futures_util::future::pending::<()>().await,
                }
            };

            tokio::select! {
                () = cancel.cancelled() => break,
                () = silence => {
                    debug!("silence timeout; auto-committing '{}'", acc.text.trim());
                    self.commit_utterance(&mut acc).await?;
                }
                outcome = outcome_rx.recv() => {
                    let Some((generation, outcome)) = outcome else { break };
                    if generation != acc.generation {
                        // Classifier answered for an utterance that has
                        // already been committed or revoked.
                        continue;
                    }
                    self.apply_outcome(&mut acc, outcome).await?;
                }
                iu = sub.recv() => {
                    let Some(iu) = iu else { break };
                    match iu.update_type {
                        UpdateType::Add => {
                            let Some(token) = iu.body.as_text() else { continue };
                            if token.is_empty() {
                                continue;
                            }
                            self.handle_add(&mut acc, &iu.id, token, &outcome_tx, &cancel);
                        }
                        UpdateType::Commit => {
                            if let Some(tail) = iu.body.as_text() {
                                if !tail.is_empty() {
                                    append_token(&mut acc.text, tail, &self.config.spacer);
                                }
                            }
                            self.commit_utterance(&mut acc).await?;
                        }
                        UpdateType::Revoke => {
                            // The recognizer withdrew the utterance; start over.
                            acc.reset_input();
                        }
                    }
                }
            }
        }

        info!("text VAP shut down");
        Ok(())
    }

    fn handle_add(
        &self,
        acc: &mut Accumulator,
        id: &str,
        token: &str,
        outcome_tx: &mpsc::Sender<(u64, ReactionOutcome)>,
        cancel: &CancellationToken,
    ) {
        if !acc.utterance_active {
            // Utterance start: reaction budgets reset here and at COMMIT.
            acc.utterance_active = true;
            acc.verbal_used = 0;
            acc.nonverbal_used = 0;
            acc.last_committed_text = None;
        }

        // Simulated recognizers (the web UI) publish whole-utterance rewrites
        // under a partial-tagged id; real token IUs append.
        let mut meaningful_change = false;
        if id.contains("partial") {
            if acc.text != token {
                acc.text = token.to_owned();
                meaningful_change = true;
            }
        } else {
            append_token(&mut acc.text, token, &self.config.spacer);
        }

        acc.deadline = Some(tokio::time::Instant::now() + self.max_silence);
        acc.adds_since_classify += 1;

        if meaningful_change || acc.adds_since_classify >= self.config.text_vap_interval.max(1) {
            acc.adds_since_classify = 0;
            self.spawn_classification(acc.generation, acc.text.clone(), outcome_tx, cancel);
        }
    }

    fn spawn_classification(
        &self,
        generation: u64,
        current_text: String,
        outcome_tx: &mpsc::Sender<(u64, ReactionOutcome)>,
        cancel: &CancellationToken,
    ) {
        let backend = Arc::clone(&self.backend);
        let model = self.llm.reaction_model.clone();
        let max_tokens = self.llm.max_tokens;
        let prompt = self.prompts.reaction.clone();
        let outcome_tx = outcome_tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let messages = [
                ChatMessage::new("system", prompt),
                ChatMessage::new("user", current_text),
            ];
            let completion = async {
                let stream = backend.stream_chat(&model, &messages, max_tokens).await?;
                stream.collect_text().await
            };
            tokio::select! {
                () = cancel.cancelled() => {}
                completion = completion => match completion {
                    Ok(text) => {
                        let _ = outcome_tx.send((generation, parse_reaction(&text))).await;
                    }
                    Err(e) => warn!("reaction classification failed: {e}"),
                }
            }
        });
    }

    async fn apply_outcome(&self, acc: &mut Accumulator, outcome: ReactionOutcome) -> Result<()> {
        if let Some(bc) = outcome
            .backchannel
            .as_deref()
            .filter(|bc| !bc.is_empty())
        {
            if acc.verbal_used < self.config.max_verbal_backchannel_num {
                acc.verbal_used += 1;
                let iu =
                    self.producer
                        .make_iu(Body::Text(bc.to_owned()), exchange::BC, UpdateType::Add);
                self.broker.publish(exchange::BC, &iu).await?;
            }
        }

        let new_expression = outcome
            .expression
            .filter(|e| *e != acc.current_expression);
        let new_action = outcome.action.filter(|a| *a != acc.current_action);
        if new_expression.is_some() || new_action.is_some() {
            if acc.nonverbal_used < self.config.max_nonverbal_backchannel_num {
                acc.nonverbal_used += 1;
                if let Some(e) = &new_expression {
                    acc.current_expression = e.clone();
                }
                if let Some(a) = &new_action {
                    acc.current_action = a.clone();
                }
                let reaction = Reaction {
                    expression: new_expression,
                    action: new_action,
                    concept: None,
                    current_text: Some(acc.text.trim().to_owned()),
                };
                let mut iu = self.producer.make_iu(
                    Body::Reaction(reaction),
                    exchange::EMO_ACT,
                    UpdateType::Add,
                );
                iu.data_type = Some("expression_and_action".to_owned());
                self.broker.publish(exchange::EMO_ACT, &iu).await?;
            }
        }

        if let Some(score) = outcome.score {
            if score >= self.config.min_text_vap_threshold {
                debug!("turn-yield score {score}; suggesting system turn");
                let iu = self.producer.make_iu(
                    Body::Event {
                        event: TurnEvent::SystemTakeTurn,
                        text: None,
                    },
                    exchange::VAP,
                    UpdateType::Add,
                );
                self.broker.publish(exchange::VAP, &iu).await?;
            }
        }

        Ok(())
    }

    /// Commit the accumulated utterance: ASR_COMMIT with the final text,
    /// then SYSTEM_TAKE_TURN, then a neutral reaction reset. Used by both
    /// the silence timeout and an external recognizer COMMIT; the same
    /// final text is never committed twice within one turn.
    async fn commit_utterance(&self, acc: &mut Accumulator) -> Result<()> {
        let text = acc.text.trim().to_owned();

        let duplicate = acc.last_committed_text.as_deref() == Some(text.as_str());
        if !text.is_empty() && !duplicate {
            let commit = self.producer.make_iu(
                Body::Event {
                    event: TurnEvent::AsrCommit,
                    text: Some(text.clone()),
                },
                exchange::VAP,
                UpdateType::Add,
            );
            self.broker.publish(exchange::VAP, &commit).await?;

            let take_turn = self.producer.make_iu(
                Body::Event {
                    event: TurnEvent::SystemTakeTurn,
                    text: None,
                },
                exchange::VAP,
                UpdateType::Add,
            );
            self.broker.publish(exchange::VAP, &take_turn).await?;
            acc.last_committed_text = Some(text);
        }

        // Reset the avatar to neutral between turns.
        if acc.current_expression != DEFAULT_EXPRESSION || acc.current_action != DEFAULT_ACTION {
            acc.current_expression = DEFAULT_EXPRESSION.to_owned();
            acc.current_action = DEFAULT_ACTION.to_owned();
            let mut iu = self.producer.make_iu(
                Body::Reaction(Reaction {
                    expression: Some(DEFAULT_EXPRESSION.to_owned()),
                    action: Some(DEFAULT_ACTION.to_owned()),
                    concept: None,
                    current_text: None,
                }),
                exchange::EMO_ACT,
                UpdateType::Add,
            );
            iu.data_type = Some("expression_and_action".to_owned());
            self.broker.publish(exchange::EMO_ACT, &iu).await?;
        }

        acc.reset_input();
        acc.verbal_used = 0;
        acc.nonverbal_used = 0;
        Ok(())
    }
}

fn append_token(text: &mut String, token: &str, spacer: &str) {
    if !text.is_empty() {
        text.push_str(spacer);
    }
    text.push_str(token);
}
