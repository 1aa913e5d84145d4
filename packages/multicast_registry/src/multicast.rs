//! Parallel fan-out delivery with configurable semantics.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use prism_capabilities::{OpContext, PrismError, PubSub, Queue, Result};
use prism_patterns::DeliveryMode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

/// Metadata key carrying the multicast id on every published message
pub const MULTICAST_ID_KEY: &str = "prism-multicast-id";

/// Aggregated result of one multicast. Per-target failures never abort the
/// call; they are counted here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MulticastOutcome {
    pub multicast_id: String,
    pub target_count: usize,
    pub delivered_count: usize,
    pub failed_count: usize,
    /// `(target id, reason)` for each failed target
    #[serde(default)]
    pub failures: Vec<(String, String)>,
}

/// Publishes one payload to the per-identity topics of a target set
pub struct MulticastDispatcher {
    pubsub: Arc<dyn PubSub>,
    durability: Option<Arc<dyn Queue>>,
    topic_prefix: String,
    delivery: DeliveryMode,
    retry_attempts: u32,
    retry_delay: std::time::Duration,
}

impl MulticastDispatcher {
    pub fn new(
        pubsub: Arc<dyn PubSub>,
        durability: Option<Arc<dyn Queue>>,
        topic_prefix: impl Into<String>,
        delivery: DeliveryMode,
        retry_attempts: u32,
        retry_delay: std::time::Duration,
    ) -> Result<Self> {
        if delivery == DeliveryMode::ExactlyOnce && durability.is_none() {
            return Err(PrismError::validation(
                "exactly-once delivery requires a durability slot",
            ));
        }
        Ok(Self {
            pubsub,
            durability,
            topic_prefix: topic_prefix.into(),
            delivery,
            retry_attempts,
            retry_delay,
        })
    }

    pub fn topic_for(&self, id: &str) -> String {
        format!("{}{id}", self.topic_prefix)
    }

    /// Fan `payload` out to every id in `targets`. Publication order across
    /// targets is unspecified; targets not yet started when the context is
    /// cancelled are counted as failed.
    pub async fn dispatch(
        &self,
        ctx: &OpContext,
        targets: &[String],
        payload: &[u8],
    ) -> Result<MulticastOutcome> {
        let multicast_id = Uuid::new_v4().to_string();
        let mut outcome = MulticastOutcome {
            multicast_id: multicast_id.clone(),
            target_count: targets.len(),
            ..Default::default()
        };
        if targets.is_empty() {
            return Ok(outcome);
        }

        let deliveries = targets.iter().map(|id| {
            let multicast_id = multicast_id.clone();
            async move {
                if ctx.is_cancelled() {
                    return (id.clone(), Err(PrismError::cancelled("multicast target")));
                }
                let result = self
                    .deliver_one(ctx, &multicast_id, id, payload.to_vec())
                    .await;
                (id.clone(), result)
            }
        });

        for (id, result) in join_all(deliveries).await {
            match result {
                Ok(()) => outcome.delivered_count += 1,
                Err(e) => {
                    outcome.failed_count += 1;
                    outcome.failures.push((id, e.to_string()));
                }
            }
        }
        debug!(
            multicast_id = %outcome.multicast_id,
            targets = outcome.target_count,
            delivered = outcome.delivered_count,
            failed = outcome.failed_count,
            "multicast dispatched"
        );
        Ok(outcome)
    }

    async fn deliver_one(
        &self,
        ctx: &OpContext,
        multicast_id: &str,
        target_id: &str,
        payload: Vec<u8>,
    ) -> Result<()> {
        let topic = self.topic_for(target_id);
        let metadata =
            BTreeMap::from([(MULTICAST_ID_KEY.to_string(), multicast_id.to_string())]);

        match self.delivery {
            // Single attempt; a full subscriber channel already counted as
            // delivered at the publisher.
            DeliveryMode::AtMostOnce => {
                self.pubsub
                    .publish(ctx, &topic, payload, metadata)
                    .await
                    .map(|_| ())
            }
            DeliveryMode::AtLeastOnce => {
                let mut attempt = 0u32;
                loop {
                    match self
                        .pubsub
                        .publish(ctx, &topic, payload.clone(), metadata.clone())
                        .await
                    {
                        Ok(_) => return Ok(()),
                        Err(e) if e.is_transient() && attempt < self.retry_attempts => {
                            attempt += 1;
                            let backoff = self.retry_delay * 2u32.saturating_pow(attempt - 1);
                            warn!(target_id, attempt, "multicast publish retry: {e}");
                            tokio::time::sleep(backoff).await;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            // Enqueue durably, publish, then acknowledge the queue entry.
            DeliveryMode::ExactlyOnce => {
                let durability = self
                    .durability
                    .as_ref()
                    .ok_or_else(|| PrismError::fatal("durability slot vanished"))?;
                let queue_name = format!("multicast:{target_id}");
                let entry_id = durability
                    .enqueue(ctx, &queue_name, payload.clone(), metadata.clone())
                    .await?;
                self.pubsub.publish(ctx, &topic, payload, metadata).await?;
                durability.acknowledge(ctx, &queue_name, &entry_id).await?;
                Ok(())
            }
        }
    }
}
