//! NATS transport for the broker contract.
//!
//! Core NATS subjects already have the delivery semantics the IU bus needs:
//! fan-out to every subscriber, at-most-once, non-durable, ordered per
//! subscriber. This client adds the envelope codec, independent publish and
//! consume connections (a stalled consumer cannot block a publisher), and
//! reconnection with bounded backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{record_protocol_violation, Broker, Subscription};
use crate::config::BrokerConfig;
use crate::error::Result;
use crate::iu::IncrementalUnit;

/// Broker client backed by a NATS server.
pub struct NatsBroker {
    config: BrokerConfig,
    /// Publish connection. All publishes serialize behind this mutex; the
    /// connection is re-established in place after a loss.
    publisher: Mutex<Option<async_nats::Client>>,
    cancel: CancellationToken,
}

impl NatsBroker {
    /// Connect to the configured NATS server.
    ///
    /// The initial connection retries with bounded backoff until it succeeds
    /// or `cancel` fires, matching the reconnect behavior after an outage.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::CoreError::Cancelled`] if cancelled before the
    /// first connection is established.
    pub async fn connect(config: &BrokerConfig, cancel: CancellationToken) -> Result<Self> {
        let client = connect_with_backoff(config, &cancel)
            .await
            .ok_or(crate::error::CoreError::Cancelled)?;
        info!("connected to broker at {}", config.host);
        Ok(Self {
            config: config.clone(),
            publisher: Mutex::new(Some(client)),
            cancel,
        })
    }
}

/// Dial until connected, sleeping `reconnect_min_secs`..`reconnect_max_secs`
/// between attempts. Returns `None` when cancelled.
async fn connect_with_backoff(
    config: &BrokerConfig,
    cancel: &CancellationToken,
) -> Option<async_nats::Client> {
    let mut backoff = Duration::from_secs(config.reconnect_min_secs.max(1));
    let cap = Duration::from_secs(config.reconnect_max_secs.max(1));
    loop {
        tokio::select! {
            () = cancel.cancelled() => return None,
            attempt = async_nats::connect(config.host.as_str()) => {
                match attempt {
                    Ok(client) => return Some(client),
                    Err(e) => {
                        warn!("broker connect to {} failed: {e}; retrying in {backoff:?}", config.host);
                    }
                }
            }
        }
        tokio::select! {
            () = cancel.cancelled() => return None,
            () = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(cap);
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn publish(&self, exchange: &str, iu: &IncrementalUnit) -> Result<()> {
        let payload: bytes::Bytes = iu.to_wire()?.into();
        let grace = Duration::from_secs_f64(self.config.publish_grace_secs.max(0.0));

        let mut publisher = self.publisher.lock().await;

        if let Some(client) = publisher.as_ref() {
            match client.publish(exchange.to_string(), payload.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("publish on '{exchange}' failed: {e}; reconnecting");
                    *publisher = None;
                }
            }
        }

        // Outage path: wait at most the grace period for a fresh connection,
        // then drop the message with a structured warning. Publishing must
        // never wedge its caller.
        let reconnect = connect_with_backoff(&self.config, &self.cancel);
        match tokio::time::timeout(grace, reconnect).await {
            Ok(Some(client)) => {
                let result = client.publish(exchange.to_string(), payload).await;
                *publisher = Some(client);
                if let Err(e) = result {
                    warn!(
                        exchange,
                        producer = %iu.producer,
                        update_type = ?iu.update_type,
                        "dropping IU after reconnect publish failed: {e}"
                    );
                }
            }
            Ok(None) => return Err(crate::error::CoreError::Cancelled),
            Err(_) => {
                warn!(
                    exchange,
                    producer = %iu.producer,
                    update_type = ?iu.update_type,
                    "dropping IU: broker unreachable for {:.1}s",
                    grace.as_secs_f64()
                );
            }
        }
        Ok(())
    }

    async fn subscribe(&self, exchange: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(self.config.subscriber_queue_bound.max(1));
        let config = self.config.clone();
        let cancel = self.cancel.clone();
        let exchange = exchange.to_owned();

        // Each subscriber owns a private consume connection, so a slow or
        // wedged consumer cannot stall the publish channel or its peers.
        tokio::spawn(async move {
            loop {
                let Some(client) = connect_with_backoff(&config, &cancel).await else {
                    return;
                };
                let mut stream = match client.subscribe(exchange.clone()).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("subscribe to '{exchange}' failed: {e}; retrying");
                        continue;
                    }
                };

                loop {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        msg = stream.next() => {
                            let Some(msg) = msg else {
                                warn!("consume channel for '{exchange}' lost; rebinding");
                                break;
                            };
                            let iu = match IncrementalUnit::from_wire(&msg.payload) {
                                Ok(iu) => iu,
                                Err(e) => {
                                    record_protocol_violation(&exchange, &e.to_string());
                                    continue;
                                }
                            };
                            match tx.try_send(iu) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    // Queue bound exceeded: shed this message,
                                    // the consumer keeps its binding.
                                    warn!("subscriber queue on '{exchange}' full; dropping IU");
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => return,
                            }
                        }
                    }
                }
            }
        });

        Ok(Subscription::new(rx))
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        let mut publisher = self.publisher.lock().await;
        if let Some(client) = publisher.take() {
            if let Err(e) = client.flush().await {
                warn!("flush on close failed: {e}");
            }
        }
        Ok(())
    }
}

/// Convenience alias used by module runners.
pub type SharedBroker = Arc<dyn Broker>;
