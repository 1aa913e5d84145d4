//! In-memory pub/sub with bounded subscriber channels.

use std::collections::BTreeMap;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use prism_capabilities::{
    subscription_channel, Message, OpContext, PubSub, Result, Subscription, SubscriptionSender,
};
use uuid::Uuid;

/// Topic fan-out over bounded channels. Publication is non-blocking: a full
/// subscriber channel drops the message and bumps the dropped counter
/// (at-most-once).
pub struct MemoryPubSub {
    topics: DashMap<String, HashMap<String, SubscriptionSender>>,
    channel_capacity: usize,
}

impl MemoryPubSub {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            channel_capacity,
        }
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Messages dropped across all live subscriptions
    pub fn dropped_total(&self) -> u64 {
        self.topics
            .iter()
            .map(|t| t.value().values().map(|s| s.dropped_count()).sum::<u64>())
            .sum()
    }

    pub(crate) fn close_all(&self) {
        self.topics.clear();
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(
        &self,
        _ctx: &OpContext,
        topic: &str,
        payload: Vec<u8>,
        metadata: BTreeMap<String, String>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let message = Message {
            id: id.clone(),
            topic: topic.to_string(),
            payload,
            metadata,
            published_at: Utc::now(),
        };

        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            // Deliver to every live subscriber, pruning closed ones.
            subscribers.retain(|_, sender| !sender.is_closed());
            for sender in subscribers.values() {
                sender.try_deliver(message.clone());
            }
        }
        Ok(id)
    }

    async fn subscribe(
        &self,
        _ctx: &OpContext,
        topic: &str,
        subscriber_id: &str,
    ) -> Result<Subscription> {
        let (sender, subscription) =
            subscription_channel(topic, subscriber_id, self.channel_capacity);
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(subscriber_id.to_string(), sender);
        Ok(subscription)
    }

    async fn unsubscribe(&self, _ctx: &OpContext, topic: &str, subscriber_id: &str) -> Result<()> {
        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            subscribers.remove(subscriber_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber() {
        let ps = MemoryPubSub::new(16);
        let ctx = OpContext::new();
        let mut a = ps.subscribe(&ctx, "t", "a").await.unwrap();
        let mut b = ps.subscribe(&ctx, "t", "b").await.unwrap();

        ps.publish(&ctx, "t", b"hello".to_vec(), BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(a.next().await.unwrap().payload, b"hello");
        assert_eq!(b.next().await.unwrap().payload, b"hello");
    }

    #[tokio::test]
    async fn slow_subscriber_drops_excess_and_counts() {
        let ps = MemoryPubSub::new(10);
        let ctx = OpContext::new();
        let mut sub = ps.subscribe(&ctx, "t", "slow").await.unwrap();

        for _ in 0..1000 {
            // Publisher always succeeds regardless of the full channel.
            ps.publish(&ctx, "t", vec![0u8], BTreeMap::new())
                .await
                .unwrap();
        }

        let mut received = 0u64;
        while sub.try_next().is_some() {
            received += 1;
        }
        assert!(received < 1000);
        assert_eq!(ps.dropped_total(), 1000 - received);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let ps = MemoryPubSub::new(16);
        let ctx = OpContext::new();
        let mut sub = ps.subscribe(&ctx, "t", "a").await.unwrap();
        ps.unsubscribe(&ctx, "t", "a").await.unwrap();
        ps.publish(&ctx, "t", vec![1], BTreeMap::new()).await.unwrap();
        // Channel closed with nothing delivered.
        assert!(sub.next().await.is_none());
        // Unknown subscriber is fine.
        ps.unsubscribe(&ctx, "t", "ghost").await.unwrap();
    }
}
