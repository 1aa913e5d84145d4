//! Generic data-plane dispatch.
//!
//! Maps interface verbs (`KeyValueBasic.Set`, `PubSub.Subscribe`, ...) onto
//! the bound slot drivers. Pattern-specific verbs are offered to the
//! behavior first; everything else resolves to the first bound slot that
//! carries the needed capability. In-flight requests are tracked so Drain
//! can report counts, and new requests are refused while draining.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prism_capabilities::{
    Capability, DriverHandle, OpContext, PrismError, Result,
};
use prism_rpc::RpcService;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::runtime::{InFlightGauge, PatternBehavior};
use crate::slots::SlotTable;

#[derive(Debug, Deserialize)]
struct KvSetParams {
    key: String,
    value: Vec<u8>,
    #[serde(default)]
    ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct KeyParams {
    key: String,
}

#[derive(Debug, Deserialize)]
struct ScanParams {
    prefix: String,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default = "default_scan_limit")]
    limit: usize,
}

fn default_scan_limit() -> usize {
    prism_capabilities::MIN_SCAN_BATCH
}

#[derive(Debug, Deserialize)]
struct PublishParams {
    topic: String,
    payload: Vec<u8>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct SubscribeParams {
    topic: String,
    subscriber_id: String,
}

#[derive(Debug, Deserialize)]
struct EnqueueParams {
    queue: String,
    payload: Vec<u8>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct QueueParams {
    queue: String,
}

#[derive(Debug, Deserialize)]
struct AcknowledgeParams {
    queue: String,
    message_id: String,
}

#[derive(Debug, Deserialize)]
struct ObjectParams {
    bucket: String,
    key: String,
}

#[derive(Debug, Deserialize)]
struct ObjectPutParams {
    bucket: String,
    key: String,
    bytes: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct ObjectTtlParams {
    bucket: String,
    key: String,
    ttl_secs: u64,
}

#[derive(Debug, Deserialize)]
struct TableAppendParams {
    table: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    payload: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct TableQueryParams {
    table: String,
    #[serde(default)]
    header_filter: BTreeMap<String, String>,
    #[serde(default = "default_scan_limit")]
    limit: usize,
}

#[derive(Debug, Serialize)]
struct GetReply {
    value: Option<Vec<u8>>,
    found: bool,
}

/// RPC service for a pattern's data plane
pub struct DataPlaneService {
    behavior: Arc<dyn PatternBehavior>,
    slots: SlotTable,
    in_flight: Arc<InFlightGauge>,
}

impl DataPlaneService {
    pub fn new(
        behavior: Arc<dyn PatternBehavior>,
        slots: SlotTable,
        in_flight: Arc<InFlightGauge>,
    ) -> Self {
        Self {
            behavior,
            slots,
            in_flight,
        }
    }

    /// First bound slot carrying `capability`, in slot-name order
    fn slot_with(&self, capability: Capability) -> Result<&DriverHandle> {
        self.slots
            .iter()
            .map(|(_, handle)| handle)
            .find(|handle| handle.has(capability))
            .ok_or_else(|| {
                PrismError::not_found(format!("no bound slot provides {capability}"))
            })
    }
}

#[async_trait]
impl RpcService for DataPlaneService {
    async fn handle(
        &self,
        ctx: &OpContext,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let _guard = self.in_flight.begin()?;

        // The pattern gets first refusal (registry operations and the like).
        if let Some(reply) = self.behavior.handle_data(ctx, method, params.clone()).await? {
            return Ok(reply);
        }

        match method {
            "KeyValueBasic.Set" => {
                let p: KvSetParams = serde_json::from_value(params)?;
                let kv = self.slot_with(Capability::KeyValueBasic)?.kv.clone();
                let kv = kv.ok_or_else(|| PrismError::fatal("kv view missing"))?;
                kv.set(ctx, &p.key, p.value, p.ttl_secs.map(Duration::from_secs))
                    .await?;
                Ok(serde_json::json!({}))
            }
            "KeyValueBasic.Get" => {
                let p: KeyParams = serde_json::from_value(params)?;
                let kv = self.slot_with(Capability::KeyValueBasic)?.kv.clone();
                let kv = kv.ok_or_else(|| PrismError::fatal("kv view missing"))?;
                let value = kv.get(ctx, &p.key).await?;
                let found = value.is_some();
                Ok(serde_json::to_value(GetReply { value, found })?)
            }
            "KeyValueBasic.Delete" => {
                let p: KeyParams = serde_json::from_value(params)?;
                let kv = self.slot_with(Capability::KeyValueBasic)?.kv.clone();
                let kv = kv.ok_or_else(|| PrismError::fatal("kv view missing"))?;
                kv.delete(ctx, &p.key).await?;
                Ok(serde_json::json!({}))
            }
            "KeyValueBasic.Exists" => {
                let p: KeyParams = serde_json::from_value(params)?;
                let kv = self.slot_with(Capability::KeyValueBasic)?.kv.clone();
                let kv = kv.ok_or_else(|| PrismError::fatal("kv view missing"))?;
                let exists = kv.exists(ctx, &p.key).await?;
                Ok(serde_json::json!({ "exists": exists }))
            }
            "KeyValueScan.Scan" => {
                let p: ScanParams = serde_json::from_value(params)?;
                let scan = self.slot_with(Capability::KeyValueScan)?.kv_scan.clone();
                let scan = scan.ok_or_else(|| PrismError::fatal("scan view missing"))?;
                let page = scan.scan(ctx, &p.prefix, p.cursor.as_deref(), p.limit).await?;
                Ok(serde_json::json!({ "keys": page.keys, "cursor": page.cursor }))
            }
            "KeyValueScan.ScanWithValues" => {
                let p: ScanParams = serde_json::from_value(params)?;
                let scan = self.slot_with(Capability::KeyValueScan)?.kv_scan.clone();
                let scan = scan.ok_or_else(|| PrismError::fatal("scan view missing"))?;
                let page = scan
                    .scan_with_values(ctx, &p.prefix, p.cursor.as_deref(), p.limit)
                    .await?;
                Ok(serde_json::json!({ "entries": page.entries, "cursor": page.cursor }))
            }
            "PubSub.Publish" => {
                let p: PublishParams = serde_json::from_value(params)?;
                let pubsub = self.slot_with(Capability::PubSub)?.pubsub.clone();
                let pubsub = pubsub.ok_or_else(|| PrismError::fatal("pubsub view missing"))?;
                let message_id = pubsub.publish(ctx, &p.topic, p.payload, p.metadata).await?;
                Ok(serde_json::json!({ "message_id": message_id }))
            }
            "PubSub.Unsubscribe" => {
                let p: SubscribeParams = serde_json::from_value(params)?;
                let pubsub = self.slot_with(Capability::PubSub)?.pubsub.clone();
                let pubsub = pubsub.ok_or_else(|| PrismError::fatal("pubsub view missing"))?;
                pubsub.unsubscribe(ctx, &p.topic, &p.subscriber_id).await?;
                Ok(serde_json::json!({}))
            }
            "Queue.Enqueue" => {
                let p: EnqueueParams = serde_json::from_value(params)?;
                let queue = self.slot_with(Capability::Queue)?.queue.clone();
                let queue = queue.ok_or_else(|| PrismError::fatal("queue view missing"))?;
                let message_id = queue.enqueue(ctx, &p.queue, p.payload, p.metadata).await?;
                Ok(serde_json::json!({ "message_id": message_id }))
            }
            "Queue.Acknowledge" => {
                let p: AcknowledgeParams = serde_json::from_value(params)?;
                let queue = self.slot_with(Capability::Queue)?.queue.clone();
                let queue = queue.ok_or_else(|| PrismError::fatal("queue view missing"))?;
                queue.acknowledge(ctx, &p.queue, &p.message_id).await?;
                Ok(serde_json::json!({}))
            }
            "ObjectStore.Put" => {
                let p: ObjectPutParams = serde_json::from_value(params)?;
                let objects = self.slot_with(Capability::ObjectStore)?.objects.clone();
                let objects = objects.ok_or_else(|| PrismError::fatal("objects view missing"))?;
                objects.put(ctx, &p.bucket, &p.key, p.bytes).await?;
                Ok(serde_json::json!({}))
            }
            "ObjectStore.Get" => {
                let p: ObjectParams = serde_json::from_value(params)?;
                let objects = self.slot_with(Capability::ObjectStore)?.objects.clone();
                let objects = objects.ok_or_else(|| PrismError::fatal("objects view missing"))?;
                let bytes = objects.get(ctx, &p.bucket, &p.key).await?;
                Ok(serde_json::json!({ "bytes": bytes }))
            }
            "ObjectStore.Delete" => {
                let p: ObjectParams = serde_json::from_value(params)?;
                let objects = self.slot_with(Capability::ObjectStore)?.objects.clone();
                let objects = objects.ok_or_else(|| PrismError::fatal("objects view missing"))?;
                objects.delete(ctx, &p.bucket, &p.key).await?;
                Ok(serde_json::json!({}))
            }
            "ObjectStore.Exists" => {
                let p: ObjectParams = serde_json::from_value(params)?;
                let objects = self.slot_with(Capability::ObjectStore)?.objects.clone();
                let objects = objects.ok_or_else(|| PrismError::fatal("objects view missing"))?;
                let exists = objects.exists(ctx, &p.bucket, &p.key).await?;
                Ok(serde_json::json!({ "exists": exists }))
            }
            "ObjectStore.GetMetadata" => {
                let p: ObjectParams = serde_json::from_value(params)?;
                let objects = self.slot_with(Capability::ObjectStore)?.objects.clone();
                let objects = objects.ok_or_else(|| PrismError::fatal("objects view missing"))?;
                let metadata = objects.get_metadata(ctx, &p.bucket, &p.key).await?;
                Ok(serde_json::to_value(metadata)?)
            }
            "ObjectStore.SetTTL" => {
                let p: ObjectTtlParams = serde_json::from_value(params)?;
                let objects = self.slot_with(Capability::ObjectStore)?.objects.clone();
                let objects = objects.ok_or_else(|| PrismError::fatal("objects view missing"))?;
                objects
                    .set_ttl(ctx, &p.bucket, &p.key, Duration::from_secs(p.ttl_secs))
                    .await?;
                Ok(serde_json::json!({}))
            }
            "TableWriter.Append" => {
                let p: TableAppendParams = serde_json::from_value(params)?;
                let writer = self.slot_with(Capability::TableWriter)?.table_writer.clone();
                let writer = writer.ok_or_else(|| PrismError::fatal("table view missing"))?;
                let event_id = writer.append(ctx, &p.table, p.headers, p.payload).await?;
                Ok(serde_json::json!({ "event_id": event_id }))
            }
            "TableReader.Query" => {
                let p: TableQueryParams = serde_json::from_value(params)?;
                let reader = self.slot_with(Capability::TableReader)?.table_reader.clone();
                let reader = reader.ok_or_else(|| PrismError::fatal("table view missing"))?;
                let events = reader.query(ctx, &p.table, p.header_filter, p.limit).await?;
                Ok(serde_json::to_value(events)?)
            }
            other => Err(PrismError::not_found(format!("unknown method: {other}"))),
        }
    }

    fn is_stream(&self, method: &str) -> bool {
        matches!(method, "PubSub.Subscribe" | "Queue.Receive")
    }

    async fn handle_stream(
        &self,
        ctx: &OpContext,
        method: &str,
        params: serde_json::Value,
    ) -> Result<mpsc::Receiver<serde_json::Value>> {
        match method {
            "PubSub.Subscribe" => {
                let p: SubscribeParams = serde_json::from_value(params)?;
                let pubsub = self.slot_with(Capability::PubSub)?.pubsub.clone();
                let pubsub = pubsub.ok_or_else(|| PrismError::fatal("pubsub view missing"))?;
                let mut subscription = pubsub.subscribe(ctx, &p.topic, &p.subscriber_id).await?;

                let (tx, rx) = mpsc::channel(prism_capabilities::DEFAULT_CHANNEL_CAPACITY);
                tokio::spawn(async move {
                    while let Some(message) = subscription.next().await {
                        let Ok(frame) = serde_json::to_value(&message) else {
                            continue;
                        };
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                });
                Ok(rx)
            }
            "Queue.Receive" => {
                let p: QueueParams = serde_json::from_value(params)?;
                let queue = self.slot_with(Capability::Queue)?.queue.clone();
                let queue = queue.ok_or_else(|| PrismError::fatal("queue view missing"))?;
                let mut receiver = queue.receive(ctx, &p.queue).await?;

                let (tx, rx) = mpsc::channel(prism_capabilities::DEFAULT_CHANNEL_CAPACITY);
                tokio::spawn(async move {
                    while let Some(message) = receiver.next().await {
                        let Ok(frame) = serde_json::to_value(&message) else {
                            continue;
                        };
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                });
                Ok(rx)
            }
            other => Err(PrismError::not_found(format!("unknown stream method: {other}"))),
        }
    }
}
