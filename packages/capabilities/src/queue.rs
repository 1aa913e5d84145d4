//! Work-queue capability contract.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::context::OpContext;
use crate::error::Result;

/// A queued message awaiting acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    pub queue: String,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub enqueued_at: DateTime<Utc>,
    /// Incremented on each delivery, including redeliveries
    pub delivery_count: u32,
}

/// Receiving half of a queue consumer
pub struct QueueReceiver {
    pub queue: String,
    receiver: mpsc::Receiver<QueueMessage>,
}

impl QueueReceiver {
    pub fn new(queue: impl Into<String>, receiver: mpsc::Receiver<QueueMessage>) -> Self {
        Self {
            queue: queue.into(),
            receiver,
        }
    }

    pub async fn next(&mut self) -> Option<QueueMessage> {
        self.receiver.recv().await
    }

    pub fn try_next(&mut self) -> Option<QueueMessage> {
        self.receiver.try_recv().ok()
    }
}

/// Queue with explicit acknowledgement. Unacknowledged messages are
/// redelivered with an incremented `delivery_count`.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn enqueue(
        &self,
        ctx: &OpContext,
        queue: &str,
        payload: Vec<u8>,
        metadata: BTreeMap<String, String>,
    ) -> Result<String>;

    async fn receive(&self, ctx: &OpContext, queue: &str) -> Result<QueueReceiver>;

    async fn acknowledge(&self, ctx: &OpContext, queue: &str, message_id: &str) -> Result<()>;
}
