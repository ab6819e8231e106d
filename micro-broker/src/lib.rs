//! Pub/sub broker contract and the in-process implementation.
//!
//! Delivery is best-effort and at-most-once per subscriber; exactly-once is
//! explicitly out of scope. Handlers run as spawned tasks bounded by a
//! shared concurrency limit so a slow subscriber cannot pile up unbounded
//! work.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use micro_core::Message;
use tokio::sync::Semaphore;
use tracing::debug;

const DEFAULT_MAX_CONCURRENCY: usize = 1024;

pub type Handler =
    Arc<dyn Fn(Arc<Message>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub enum BrokerError {
    NotConnected,
    Internal(String),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::NotConnected => write!(f, "broker is not connected"),
            BrokerError::Internal(msg) => write!(f, "broker error: {msg}"),
        }
    }
}

impl std::fmt::Debug for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl std::error::Error for BrokerError {}

/// Handle for one topic subscription. Dropping it does not unsubscribe;
/// call [`unsubscribe`](Subscription::unsubscribe).
pub struct Subscription {
    topic: String,
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Stop receiving. Idempotent.
    pub fn unsubscribe(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Message broker contract.
#[async_trait]
pub trait Broker: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(&self) -> Result<(), BrokerError>;

    async fn disconnect(&self) -> Result<(), BrokerError>;

    async fn publish(&self, topic: &str, msg: &Message) -> Result<(), BrokerError>;

    async fn subscribe(&self, topic: &str, handler: Handler)
        -> Result<Subscription, BrokerError>;
}

/// Wrap an async closure into the boxed handler shape [`Broker::subscribe`]
/// expects.
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(f(msg)))
}

struct Subscriber {
    id: u64,
    active: Arc<AtomicBool>,
    handler: Handler,
}

/// In-process broker: a guarded topic map with handlers spawned per
/// delivery.
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
    semaphore: Arc<Semaphore>,
    connected: AtomicBool,
    next_id: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        MemoryBroker::with_concurrency(DEFAULT_MAX_CONCURRENCY)
    }

    /// Bound the number of concurrently running handlers across all topics.
    pub fn with_concurrency(max_concurrent: usize) -> Self {
        MemoryBroker {
            topics: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            connected: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        MemoryBroker::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.connected.store(false, Ordering::SeqCst);
        self.topics.lock().unwrap().clear();
        Ok(())
    }

    async fn publish(&self, topic: &str, msg: &Message) -> Result<(), BrokerError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected);
        }
        let handlers: Vec<Handler> = {
            let mut topics = self.topics.lock().unwrap();
            let Some(subscribers) = topics.get_mut(topic) else {
                return Ok(());
            };
            subscribers.retain(|s| s.active.load(Ordering::SeqCst));
            subscribers.iter().map(|s| s.handler.clone()).collect()
        };
        if handlers.is_empty() {
            return Ok(());
        }

        let msg = Arc::new(msg.clone());
        for handler in handlers {
            let msg = msg.clone();
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| BrokerError::Internal(e.to_string()))?;
            tokio::spawn(async move {
                handler(msg).await;
                drop(permit);
            });
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Handler,
    ) -> Result<Subscription, BrokerError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected);
        }
        let active = Arc::new(AtomicBool::new(true));
        let subscriber = Subscriber {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            active: active.clone(),
            handler,
        };
        debug!(topic, id = subscriber.id, "subscribed");
        self.topics
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push(subscriber);
        Ok(Subscription {
            topic: topic.to_string(),
            active,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn event(body: &'static [u8]) -> Message {
        Message::event("orders", "order.created", Bytes::from_static(body))
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let broker = MemoryBroker::new();
        broker.connect().await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let seen = seen.clone();
            broker
                .subscribe(
                    "order.created",
                    handler(move |_msg| {
                        let seen = seen.clone();
                        async move {
                            seen.fetch_add(1, Ordering::SeqCst);
                        }
                    }),
                )
                .await
                .unwrap();
        }

        broker.publish("order.created", &event(b"{}")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unsubscribed_handlers_stop_receiving() {
        let broker = MemoryBroker::new();
        broker.connect().await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let sub = {
            let seen = seen.clone();
            broker
                .subscribe(
                    "order.created",
                    handler(move |_msg| {
                        let seen = seen.clone();
                        async move {
                            seen.fetch_add(1, Ordering::SeqCst);
                        }
                    }),
                )
                .await
                .unwrap()
        };

        broker.publish("order.created", &event(b"{}")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        sub.unsubscribe();
        sub.unsubscribe();
        broker.publish("order.created", &event(b"{}")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let broker = MemoryBroker::new();
        broker.connect().await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            broker
                .subscribe(
                    "a",
                    handler(move |_msg| {
                        let seen = seen.clone();
                        async move {
                            seen.fetch_add(1, Ordering::SeqCst);
                        }
                    }),
                )
                .await
                .unwrap();
        }
        broker.publish("b", &event(b"{}")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disconnected_broker_rejects_publish() {
        let broker = MemoryBroker::new();
        match broker.publish("a", &event(b"{}")).await {
            Err(BrokerError::NotConnected) => {}
            other => panic!("expected NotConnected, got {other:?}"),
        }
    }
}
