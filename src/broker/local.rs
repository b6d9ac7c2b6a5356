//! In-process fan-out bus.
//!
//! Used by the all-in-one binary and by tests: every module still talks
//! through the [`Broker`] contract, but messages stay inside the process.
//! Semantics match the network transport: fan-out, at-most-once, bounded
//! subscriber queues that shed load when a consumer falls behind.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use super::{Broker, Subscription};
use crate::error::{CoreError, Result};
use crate::iu::IncrementalUnit;

/// Single-process fan-out bus over broadcast channels.
pub struct LocalBus {
    exchanges: Mutex<HashMap<String, broadcast::Sender<IncrementalUnit>>>,
    queue_bound: usize,
    closed: Mutex<bool>,
}

impl LocalBus {
    /// Create a bus whose per-subscriber queues hold at most `queue_bound`
    /// undelivered IUs.
    pub fn new(queue_bound: usize) -> Self {
        Self {
            exchanges: Mutex::new(HashMap::new()),
            queue_bound: queue_bound.max(1),
            closed: Mutex::new(false),
        }
    }

    fn sender_for(&self, exchange: &str) -> broadcast::Sender<IncrementalUnit> {
        let mut exchanges = self
            .exchanges
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        exchanges
            .entry(exchange.to_owned())
            .or_insert_with(|| broadcast::channel(self.queue_bound).0)
            .clone()
    }

    fn is_closed(&self) -> bool {
        *self
            .closed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(crate::config::BrokerConfig::default().subscriber_queue_bound)
    }
}

#[async_trait]
impl Broker for LocalBus {
    async fn publish(&self, exchange: &str, iu: &IncrementalUnit) -> Result<()> {
        if self.is_closed() {
            return Err(CoreError::Transport("bus closed".to_owned()));
        }
        // No subscribers is fine on a fan-out exchange.
        let _ = self.sender_for(exchange).send(iu.clone());
        Ok(())
    }

    async fn subscribe(&self, exchange: &str) -> Result<Subscription> {
        if self.is_closed() {
            return Err(CoreError::Transport("bus closed".to_owned()));
        }
        let mut source = self.sender_for(exchange).subscribe();
        let (tx, rx) = mpsc::channel(self.queue_bound);
        let exchange = exchange.to_owned();
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(iu) => {
                        if tx.send(iu).await.is_err() {
                            // Subscriber dropped; unbind the queue.
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(lost)) => {
                        // Slow consumer: shed the backlog and rebind.
                        warn!("subscriber on '{exchange}' lagged, lost {lost} IUs");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(rx))
    }

    async fn close(&self) -> Result<()> {
        *self
            .closed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = true;
        self.exchanges
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::iu::{Body, IuProducer, UpdateType};

    fn text_iu(producer: &IuProducer, body: &str) -> IncrementalUnit {
        producer.make_iu(Body::Text(body.to_owned()), "asr", UpdateType::Add)
    }

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber() {
        let bus = LocalBus::new(8);
        let mut a = bus.subscribe("asr").await.unwrap();
        let mut b = bus.subscribe("asr").await.unwrap();

        let producer = IuProducer::new("test");
        bus.publish("asr", &text_iu(&producer, "hello")).await.unwrap();

        assert_eq!(a.recv().await.unwrap().body.as_text(), Some("hello"));
        assert_eq!(b.recv().await.unwrap().body.as_text(), Some("hello"));
    }

    #[tokio::test]
    async fn per_subscriber_order_is_publication_order() {
        let bus = LocalBus::new(64);
        let mut sub = bus.subscribe("asr").await.unwrap();
        let producer = IuProducer::new("test");
        for i in 0..10 {
            bus.publish("asr", &text_iu(&producer, &format!("t{i}")))
                .await
                .unwrap();
        }
        for i in 0..10 {
            let iu = sub.recv().await.unwrap();
            assert_eq!(iu.body.as_text(), Some(format!("t{i}").as_str()));
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = LocalBus::new(8);
        let producer = IuProducer::new("test");
        bus.publish("score", &text_iu(&producer, "x")).await.unwrap();
    }

    #[tokio::test]
    async fn closed_bus_rejects_publish() {
        let bus = LocalBus::new(8);
        bus.close().await.unwrap();
        let producer = IuProducer::new("test");
        let err = bus.publish("asr", &text_iu(&producer, "x")).await.unwrap_err();
        assert!(matches!(err, CoreError::Transport(_)));
    }
}
