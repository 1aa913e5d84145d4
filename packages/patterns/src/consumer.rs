//! Consumer pattern.
//!
//! Binds a message source (pub/sub or queue), an optional state store, an
//! optional dead-letter queue, and an optional object store for claim-check
//! resolution. Each delivery runs the user processor under a bounded
//! timeout; failures retry up to `max_retries`, after which the message is
//! dead-lettered exactly once and the offset advances.
//!
//! Without a state store the consumer runs in stateless mode: the offset is
//! virtual and retry counts do not survive a restart.

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use flate2::read::GzDecoder;
use prism_capabilities::{
    Capability, HealthReport, KeyValueBasic, Message, ObjectStore, OpContext, PrismError, PubSub,
    Queue, Result,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BehaviorConfig, PatternConfig};
use crate::runtime::{InterfaceDeclaration, PatternBehavior, PatternDescriptor};
use crate::slots::{SlotDescriptor, SlotTable};

/// Metadata flag marking a claim-check message
pub const CLAIM_CHECK_FLAG: &str = "prism-claim-check";

/// Name of the queue dead-lettered messages land on
pub const DEAD_LETTER_QUEUE: &str = "dead-letter";

/// Payload indirection record pointing at bytes in the object store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimCheck {
    pub claim_id: String,
    pub bucket: String,
    pub object_key: String,
    #[serde(default)]
    pub original_size: u64,
    #[serde(default)]
    pub compression: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    /// Hex sha256 of the original (decompressed) payload
    pub checksum: String,
}

/// Per-instance consumer position, persisted as JSON under
/// `consumer:{group}:{topic}:{instance}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumerState {
    pub offset: i64,
    #[serde(default)]
    pub last_message_id: String,
    #[serde(default)]
    pub last_updated: Option<chrono::DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
}

/// User hook invoked once per delivery
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, ctx: &OpContext, message: &Message) -> Result<()>;
}

/// Processor that only logs; the default for hosted consumers
pub struct LoggingProcessor;

#[async_trait]
impl MessageProcessor for LoggingProcessor {
    async fn process(&self, _ctx: &OpContext, message: &Message) -> Result<()> {
        info!(
            id = %message.id,
            topic = %message.topic,
            bytes = message.payload.len(),
            "consumed message"
        );
        Ok(())
    }
}

enum Disposition {
    Completed,
    Retry,
}

/// Everything one delivery needs; shared between the worker loop and the
/// pattern facade.
struct DeliveryEngine {
    instance_name: String,
    processor: Arc<dyn MessageProcessor>,
    source_pubsub: Option<Arc<dyn PubSub>>,
    source_queue: Option<Arc<dyn Queue>>,
    state: Option<Arc<dyn KeyValueBasic>>,
    dead_letter: Option<Arc<dyn Queue>>,
    objects: Option<Arc<dyn ObjectStore>>,
    behavior: BehaviorConfig,
    /// Position in stateless mode; write-through cache otherwise
    virtual_state: parking_lot::Mutex<ConsumerState>,
    processed: AtomicU64,
    dead_lettered: AtomicU64,
}

impl DeliveryEngine {
    fn state_key(&self) -> String {
        format!(
            "consumer:{}:{}:{}",
            self.behavior.consumer_group, self.behavior.topic, self.instance_name
        )
    }

    async fn load_state(&self, ctx: &OpContext) -> ConsumerState {
        if let Some(store) = &self.state {
            let key = self.state_key();
            match store.get(ctx, &key).await {
                Ok(Some(raw)) => match serde_json::from_slice(&raw) {
                    Ok(state) => return state,
                    Err(e) => warn!("consumer state at {key} is corrupt, resetting: {e}"),
                },
                Ok(None) => {}
                Err(e) => warn!("consumer state load failed, using cached: {e}"),
            }
        }
        self.virtual_state.lock().clone()
    }

    async fn save_state(&self, ctx: &OpContext, state: &ConsumerState) {
        *self.virtual_state.lock() = state.clone();
        if let Some(store) = &self.state {
            let raw = match serde_json::to_vec(state) {
                Ok(raw) => raw,
                Err(e) => {
                    error!("consumer state serialization failed: {e}");
                    return;
                }
            };
            if let Err(e) = store.set(ctx, &self.state_key(), raw, None).await {
                warn!("consumer state persist failed: {e}");
            }
        }
    }

    /// Resolve a claim-check payload: fetch, decompress, verify, strip the
    /// marker. Returns the message unchanged when it is not a claim check.
    async fn resolve_claim_check(
        &self,
        ctx: &OpContext,
        message: &Message,
    ) -> Result<(Message, Option<ClaimCheck>)> {
        if message.metadata.get(CLAIM_CHECK_FLAG).map(String::as_str) != Some("true") {
            return Ok((message.clone(), None));
        }
        let objects = self.objects.as_ref().ok_or_else(|| {
            PrismError::validation("claim-check message but no object store bound")
        })?;

        let claim: ClaimCheck = serde_json::from_slice(&message.payload)?;
        let stored = objects.get(ctx, &claim.bucket, &claim.object_key).await?;
        let bytes = match claim.compression.as_deref() {
            Some("gzip") => {
                let mut decoder = GzDecoder::new(stored.as_slice());
                let mut out = Vec::with_capacity(claim.original_size as usize);
                decoder.read_to_end(&mut out).map_err(|e| {
                    PrismError::validation(format!("claim {} gzip decode: {e}", claim.claim_id))
                })?;
                out
            }
            Some(other) => {
                return Err(PrismError::validation(format!(
                    "claim {} has unsupported compression {other:?}",
                    claim.claim_id
                )))
            }
            None => stored,
        };

        let digest = hex::encode(Sha256::digest(&bytes));
        if digest != claim.checksum {
            return Err(PrismError::validation(format!(
                "claim {} checksum mismatch",
                claim.claim_id
            )));
        }

        let mut resolved = message.clone();
        resolved.payload = bytes;
        resolved.metadata.remove(CLAIM_CHECK_FLAG);
        Ok((resolved, Some(claim)))
    }

    /// One delivery attempt with full bookkeeping
    async fn handle_delivery(&self, ctx: &OpContext, message: &Message) -> Result<Disposition> {
        let (resolved, claim) = self.resolve_claim_check(ctx, message).await?;
        let mut state = self.load_state(ctx).await;

        let processing_ctx = ctx.child(self.behavior.processing_timeout());
        let outcome = processing_ctx
            .run(
                "process message",
                self.processor.process(&processing_ctx, &resolved),
            )
            .await
            .and_then(|r| r);

        match outcome {
            Ok(()) => {
                state.offset += 1;
                state.retry_count = 0;
                state.last_message_id = resolved.id.clone();
                state.last_updated = Some(Utc::now());
                if self.behavior.auto_commit {
                    self.save_state(ctx, &state).await;
                } else {
                    *self.virtual_state.lock() = state.clone();
                }
                self.processed.fetch_add(1, Ordering::Relaxed);

                if let Some(claim) = claim {
                    if self.behavior.claim_check.delete_after_read {
                        if let Some(objects) = &self.objects {
                            // Cleanup failure never fails the message.
                            if let Err(e) =
                                objects.delete(ctx, &claim.bucket, &claim.object_key).await
                            {
                                warn!("claim {} cleanup failed: {e}", claim.claim_id);
                            }
                        }
                    }
                }
                Ok(Disposition::Completed)
            }
            Err(e) if state.retry_count < self.behavior.max_retries => {
                state.retry_count += 1;
                state.last_updated = Some(Utc::now());
                debug!(
                    id = %resolved.id,
                    retry = state.retry_count,
                    "processing failed, will retry: {e}"
                );
                self.save_state(ctx, &state).await;
                Ok(Disposition::Retry)
            }
            Err(e) => {
                // Retries exhausted: dead-letter once, then move on.
                if let Some(dlq) = &self.dead_letter {
                    let mut metadata = resolved.metadata.clone();
                    metadata.insert("prism-dlq-reason".to_string(), e.to_string());
                    metadata.insert("prism-source-topic".to_string(), resolved.topic.clone());
                    if let Err(dlq_err) = dlq
                        .enqueue(ctx, DEAD_LETTER_QUEUE, resolved.payload.clone(), metadata)
                        .await
                    {
                        error!("dead-letter enqueue failed: {dlq_err}");
                    }
                } else {
                    warn!(id = %resolved.id, "dropping message after retries, no dead-letter bound: {e}");
                }
                self.dead_lettered.fetch_add(1, Ordering::Relaxed);
                state.offset += 1;
                state.retry_count = 0;
                state.last_message_id = resolved.id.clone();
                state.last_updated = Some(Utc::now());
                self.save_state(ctx, &state).await;
                Ok(Disposition::Completed)
            }
        }
    }

    async fn run_pubsub_loop(self: Arc<Self>, pubsub: Arc<dyn PubSub>, token: CancellationToken) {
        let ctx = OpContext::new();
        let subscriber_id = format!("{}:{}", self.behavior.consumer_group, self.instance_name);
        let mut subscription = match pubsub
            .subscribe(&ctx, &self.behavior.topic, &subscriber_id)
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                error!("consumer subscribe failed: {e}");
                return;
            }
        };

        loop {
            let message = tokio::select! {
                _ = token.cancelled() => return,
                message = subscription.next() => message,
            };
            let Some(message) = message else { return };
            // Pub/sub sources have no redelivery, so retries loop here.
            loop {
                match self.handle_delivery(&ctx, &message).await {
                    Ok(Disposition::Completed) => break,
                    Ok(Disposition::Retry) => continue,
                    Err(e) => {
                        error!(id = %message.id, "delivery handling failed: {e}");
                        break;
                    }
                }
            }
        }
    }

    async fn run_queue_loop(self: Arc<Self>, queue: Arc<dyn Queue>, token: CancellationToken) {
        let ctx = OpContext::new();
        let mut receiver = match queue.receive(&ctx, &self.behavior.topic).await {
            Ok(receiver) => receiver,
            Err(e) => {
                error!("consumer queue receive failed: {e}");
                return;
            }
        };

        loop {
            let queued = tokio::select! {
                _ = token.cancelled() => return,
                queued = receiver.next() => queued,
            };
            let Some(queued) = queued else { return };
            let message = Message {
                id: queued.id.clone(),
                topic: queued.queue.clone(),
                payload: queued.payload,
                metadata: queued.metadata,
                published_at: queued.enqueued_at,
            };
            match self.handle_delivery(&ctx, &message).await {
                // Acked only on completion; a retry relies on redelivery.
                Ok(Disposition::Completed) => {
                    if let Err(e) = queue.acknowledge(&ctx, &queued.queue, &queued.id).await {
                        warn!("consumer ack failed: {e}");
                    }
                }
                Ok(Disposition::Retry) => {}
                Err(e) => error!(id = %message.id, "delivery handling failed: {e}"),
            }
        }
    }
}

/// The Consumer pattern behavior
pub struct Consumer {
    instance_name: String,
    processor: Arc<dyn MessageProcessor>,
    engine: parking_lot::RwLock<Option<Arc<DeliveryEngine>>>,
    worker: parking_lot::Mutex<Option<CancellationToken>>,
}

impl Consumer {
    pub fn new(instance_name: impl Into<String>, processor: Arc<dyn MessageProcessor>) -> Self {
        Self {
            instance_name: instance_name.into(),
            processor,
            engine: parking_lot::RwLock::new(None),
            worker: parking_lot::Mutex::new(None),
        }
    }

    fn engine(&self) -> Result<Arc<DeliveryEngine>> {
        self.engine
            .read()
            .clone()
            .ok_or_else(|| PrismError::conflict("consumer not initialized"))
    }

    pub fn processed_count(&self) -> u64 {
        self.engine()
            .map(|e| e.processed.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn dead_lettered_count(&self) -> u64 {
        self.engine()
            .map(|e| e.dead_lettered.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Current position (virtual in stateless mode)
    pub fn position(&self) -> ConsumerState {
        self.engine()
            .map(|e| e.virtual_state.lock().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PatternBehavior for Consumer {
    fn descriptor(&self) -> PatternDescriptor {
        PatternDescriptor {
            name: "consumer".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            slots: vec![
                SlotDescriptor::required_one_of(
                    "source",
                    vec![vec![Capability::PubSub], vec![Capability::Queue]],
                ),
                SlotDescriptor::optional("state", vec![Capability::KeyValueBasic]),
                SlotDescriptor::optional("dead_letter", vec![Capability::Queue]),
                SlotDescriptor::optional("objects", vec![Capability::ObjectStore]),
            ],
            interfaces: vec![InterfaceDeclaration::new(
                "ConsumerStatus",
                "prism.consumer.v1.ConsumerStatus",
                "v1",
            )],
        }
    }

    async fn on_initialize(&self, slots: &SlotTable, config: &PatternConfig) -> Result<()> {
        if config.behavior.topic.is_empty() {
            return Err(PrismError::validation("consumer requires behavior.topic"));
        }
        let source = slots.require("source")?;
        let engine = DeliveryEngine {
            instance_name: self.instance_name.clone(),
            processor: self.processor.clone(),
            source_pubsub: source.pubsub.clone(),
            source_queue: source.queue.clone(),
            state: slots.get("state").and_then(|h| h.kv.clone()),
            dead_letter: slots.get("dead_letter").and_then(|h| h.queue.clone()),
            objects: slots.get("objects").and_then(|h| h.objects.clone()),
            behavior: config.behavior.clone(),
            virtual_state: parking_lot::Mutex::new(ConsumerState::default()),
            processed: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
        };
        if engine.state.is_none() {
            info!("consumer running stateless: retries will not survive a restart");
        }
        *self.engine.write() = Some(Arc::new(engine));
        Ok(())
    }

    async fn on_start(&self) -> Result<()> {
        let engine = self.engine()?;
        let token = CancellationToken::new();
        {
            let mut worker = self.worker.lock();
            if worker.is_some() {
                return Ok(());
            }
            *worker = Some(token.clone());
        }

        if let Some(pubsub) = engine.source_pubsub.clone() {
            tokio::spawn(engine.clone().run_pubsub_loop(pubsub, token));
        } else if let Some(queue) = engine.source_queue.clone() {
            tokio::spawn(engine.clone().run_queue_loop(queue, token));
        }
        Ok(())
    }

    async fn on_stop(&self) -> Result<()> {
        if let Some(token) = self.worker.lock().take() {
            token.cancel();
        }
        Ok(())
    }

    async fn health(&self) -> HealthReport {
        HealthReport::healthy()
            .with_detail("processed", self.processed_count().to_string())
            .with_detail("dead_lettered", self.dead_lettered_count().to_string())
    }

    async fn handle_data(
        &self,
        _ctx: &OpContext,
        method: &str,
        _params: serde_json::Value,
    ) -> Result<Option<serde_json::Value>> {
        match method {
            "Consumer.Status" => {
                let state = self.position();
                Ok(Some(serde_json::json!({
                    "offset": state.offset,
                    "retry_count": state.retry_count,
                    "last_message_id": state.last_message_id,
                    "processed": self.processed_count(),
                    "dead_lettered": self.dead_lettered_count(),
                })))
            }
            _ => Ok(None),
        }
    }
}
