//! Fan-out of session events to every connected subscriber.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{RwLock, mpsc};

use strand_core::event::EventEnvelope;

pub type SubscriberId = u64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("subscriber disconnected")]
    Closed,

    #[error("subscriber is not keeping up")]
    Full,

    #[error("delivery failed: {0}")]
    Other(String),
}

/// A receiver of broadcast events (a websocket, an SSE stream, an in-process renderer).
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn deliver(&self, envelope: &EventEnvelope) -> Result<(), DeliveryError>;
}

/// Subscriber backed by a bounded channel. A full buffer counts as a failed delivery.
pub struct ChannelSubscriber {
    tx: mpsc::Sender<EventEnvelope>,
}

impl ChannelSubscriber {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<EventEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Subscriber for ChannelSubscriber {
    async fn deliver(&self, envelope: &EventEnvelope) -> Result<(), DeliveryError> {
        self.tx.try_send(envelope.clone()).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

#[derive(Default)]
pub struct Broadcaster {
    subscribers: RwLock<HashMap<SubscriberId, Arc<dyn Subscriber>>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(id, subscriber);
        tracing::info!(subscriber_id = id, total = subscribers.len(), "subscriber added");
        id
    }

    pub async fn remove(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let removed = subscribers.remove(&id).is_some();
        if removed {
            tracing::info!(subscriber_id = id, total = subscribers.len(), "subscriber removed");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.subscribers.read().await.is_empty()
    }

    /// Deliver to every subscriber. Returns the number of successful deliveries.
    ///
    /// Each delivery is attempted independently; subscribers that fail are
    /// removed once the round is over.
    pub async fn broadcast(&self, envelope: &EventEnvelope) -> usize {
        let targets: Vec<(SubscriberId, Arc<dyn Subscriber>)> = self
            .subscribers
            .read()
            .await
            .iter()
            .map(|(id, sub)| (*id, sub.clone()))
            .collect();

        let results = join_all(targets.iter().map(|(id, sub)| async move {
            (*id, sub.deliver(envelope).await)
        }))
        .await;

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, result) in results {
            match result {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::warn!(
                        subscriber_id = id,
                        session_id = %envelope.session_id,
                        event = envelope.event.kind(),
                        error = %err,
                        "dropping subscriber after failed delivery"
                    );
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in failed {
                subscribers.remove(&id);
            }
        }
        delivered
    }
}
