//! Publish/subscribe capability contract.
//!
//! Subscriptions are bounded channels. The delivery policy lives in
//! [`SubscriptionSender`]: `try_deliver` is the at-most-once path (drop on
//! full, counted), `deliver` is the at-least-once path (awaits capacity,
//! applying backpressure to the source).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::context::OpContext;
use crate::error::{PrismError, Result};

/// Default bound of a subscription channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// A delivered message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub published_at: DateTime<Utc>,
}

/// Receiving half of a subscription
pub struct Subscription {
    pub topic: String,
    pub subscriber_id: String,
    receiver: mpsc::Receiver<Message>,
}

impl Subscription {
    /// Next message; `None` once the subscription is closed
    pub async fn next(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    pub fn try_next(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }
}

/// Sending half held by the driver for one subscriber
#[derive(Clone)]
pub struct SubscriptionSender {
    sender: mpsc::Sender<Message>,
    dropped: Arc<AtomicU64>,
}

impl SubscriptionSender {
    /// At-most-once delivery: non-blocking, drops on a full channel and
    /// increments the dropped counter. Returns whether the message was
    /// accepted.
    pub fn try_deliver(&self, message: Message) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// At-least-once delivery: waits for channel capacity
    pub async fn deliver(&self, message: Message) -> Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| PrismError::transient("subscriber channel closed"))
    }

    /// Messages dropped on this subscription since creation
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Build a bounded subscription channel pair
pub fn subscription_channel(
    topic: impl Into<String>,
    subscriber_id: impl Into<String>,
    capacity: usize,
) -> (SubscriptionSender, Subscription) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let sub = Subscription {
        topic: topic.into(),
        subscriber_id: subscriber_id.into(),
        receiver,
    };
    let tx = SubscriptionSender {
        sender,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (tx, sub)
}

/// Publish/subscribe over topics
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish returns the assigned message id
    async fn publish(
        &self,
        ctx: &OpContext,
        topic: &str,
        payload: Vec<u8>,
        metadata: BTreeMap<String, String>,
    ) -> Result<String>;

    async fn subscribe(
        &self,
        ctx: &OpContext,
        topic: &str,
        subscriber_id: &str,
    ) -> Result<Subscription>;

    /// Idempotent: unsubscribing an unknown subscriber succeeds
    async fn unsubscribe(&self, ctx: &OpContext, topic: &str, subscriber_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(n: u64) -> Message {
        Message {
            id: n.to_string(),
            topic: "t".into(),
            payload: vec![0u8],
            metadata: BTreeMap::new(),
            published_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn try_deliver_drops_on_full() {
        let (tx, mut sub) = subscription_channel("t", "s", 2);
        assert!(tx.try_deliver(message(1)));
        assert!(tx.try_deliver(message(2)));
        assert!(!tx.try_deliver(message(3)));
        assert_eq!(tx.dropped_count(), 1);

        assert_eq!(sub.next().await.unwrap().id, "1");
        assert!(tx.try_deliver(message(4)));
    }
}
