//! Consumer pattern end-to-end: retries, dead-lettering, claim checks,
//! persisted state. Everything runs on the in-memory driver.

use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use prism_capabilities::{Message, OpContext, PrismError, Result};
use prism_drivers::DriverSpec;
use prism_patterns::{Consumer, MessageProcessor, PatternConfig, PatternRuntime, CLAIM_CHECK_FLAG};
use sha2::{Digest, Sha256};

/// Fails the first `fail_times` attempts, records every delivered message
struct FlakyProcessor {
    fail_times: u32,
    attempts: AtomicU32,
    seen: Mutex<Vec<Message>>,
}

impl FlakyProcessor {
    fn new(fail_times: u32) -> Arc<Self> {
        Arc::new(Self {
            fail_times,
            attempts: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl MessageProcessor for FlakyProcessor {
    async fn process(&self, _ctx: &OpContext, message: &Message) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_times {
            return Err(PrismError::transient("induced failure"));
        }
        self.seen.lock().push(message.clone());
        Ok(())
    }
}

fn consumer_config(with_dlq: bool, delete_after_read: bool) -> PatternConfig {
    let mut config = PatternConfig::new("consumer");
    config.source = Some(DriverSpec::new("memory"));
    config.state = Some(DriverSpec::new("memory"));
    config.objects = Some(DriverSpec::new("memory"));
    if with_dlq {
        config.dead_letter = Some(DriverSpec::new("memory"));
    }
    config.behavior.consumer_group = "g".to_string();
    config.behavior.topic = "events".to_string();
    config.behavior.max_retries = 2;
    config.behavior.claim_check.delete_after_read = delete_after_read;
    config
}

async fn started_consumer(
    processor: Arc<FlakyProcessor>,
    config: PatternConfig,
) -> (Arc<Consumer>, Arc<PatternRuntime>) {
    let consumer = Arc::new(Consumer::new("i1", processor));
    let runtime = Arc::new(PatternRuntime::new(consumer.clone()));
    runtime.initialize("consumer", config).await.unwrap();
    runtime.start().await.unwrap();
    (consumer, runtime)
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn successful_message_advances_offset() {
    let processor = FlakyProcessor::new(0);
    let (consumer, runtime) = started_consumer(processor.clone(), consumer_config(true, false)).await;

    let slots = runtime.slots().await;
    let pubsub = slots.require("source").unwrap().pubsub.clone().unwrap();
    let ctx = OpContext::new();
    pubsub
        .publish(&ctx, "events", b"one".to_vec(), Default::default())
        .await
        .unwrap();

    wait_until(|| consumer.processed_count() == 1).await;
    let position = consumer.position();
    assert_eq!(position.offset, 1);
    assert_eq!(position.retry_count, 0);
    assert_eq!(consumer.dead_lettered_count(), 0);
}

#[tokio::test]
async fn exhausted_retries_dead_letter_exactly_once() {
    // max_retries = 2, so 3 attempts total, then one dead-letter.
    let processor = FlakyProcessor::new(10);
    let (consumer, runtime) = started_consumer(processor.clone(), consumer_config(true, false)).await;

    let slots = runtime.slots().await;
    let pubsub = slots.require("source").unwrap().pubsub.clone().unwrap();
    let ctx = OpContext::new();
    pubsub
        .publish(&ctx, "events", b"poison".to_vec(), Default::default())
        .await
        .unwrap();

    wait_until(|| consumer.dead_lettered_count() == 1).await;
    assert_eq!(processor.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(consumer.processed_count(), 0);

    // Exactly one message landed on the dead-letter queue.
    let dlq = slots.require("dead_letter").unwrap().queue.clone().unwrap();
    let mut receiver = dlq.receive(&ctx, "dead-letter").await.unwrap();
    let dead = receiver.next().await.unwrap();
    assert_eq!(dead.payload, b"poison");
    assert!(dead.metadata.contains_key("prism-dlq-reason"));
    assert!(receiver.try_next().is_none());

    // The offset still advances past the poison message.
    assert_eq!(consumer.position().offset, 1);
    assert_eq!(consumer.position().retry_count, 0);
}

#[tokio::test]
async fn state_is_persisted_under_the_consumer_key() {
    let processor = FlakyProcessor::new(0);
    let (consumer, runtime) = started_consumer(processor, consumer_config(false, false)).await;

    let slots = runtime.slots().await;
    let pubsub = slots.require("source").unwrap().pubsub.clone().unwrap();
    let state_store = slots.require("state").unwrap().kv.clone().unwrap();
    let ctx = OpContext::new();
    pubsub
        .publish(&ctx, "events", b"m".to_vec(), Default::default())
        .await
        .unwrap();
    wait_until(|| consumer.processed_count() == 1).await;

    let raw = state_store
        .get(&ctx, "consumer:g:events:i1")
        .await
        .unwrap()
        .expect("state record");
    let state: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(state["offset"], 1);
    assert_eq!(state["retry_count"], 0);
}

#[tokio::test]
async fn claim_check_is_resolved_verified_and_cleaned_up() {
    let processor = FlakyProcessor::new(0);
    let (consumer, runtime) = started_consumer(processor.clone(), consumer_config(true, true)).await;

    let slots = runtime.slots().await;
    let pubsub = slots.require("source").unwrap().pubsub.clone().unwrap();
    let objects = slots.require("objects").unwrap().objects.clone().unwrap();
    let ctx = OpContext::new();

    // Store gzip(P) at B/K; the claim carries sha256(P).
    let payload = b"the real payload".to_vec();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&payload).unwrap();
    let compressed = encoder.finish().unwrap();
    objects.put(&ctx, "B", "K", compressed).await.unwrap();

    let claim = serde_json::json!({
        "claim_id": "c-1",
        "bucket": "B",
        "object_key": "K",
        "original_size": payload.len(),
        "compression": "gzip",
        "checksum": hex::encode(Sha256::digest(&payload)),
    });
    let metadata =
        std::collections::BTreeMap::from([(CLAIM_CHECK_FLAG.to_string(), "true".to_string())]);
    pubsub
        .publish(&ctx, "events", serde_json::to_vec(&claim).unwrap(), metadata)
        .await
        .unwrap();

    wait_until(|| consumer.processed_count() == 1).await;
    let seen = processor.seen.lock();
    assert_eq!(seen.len(), 1);
    // The processor sees the resolved payload with the flag stripped.
    assert_eq!(seen[0].payload, payload);
    assert!(!seen[0].metadata.contains_key(CLAIM_CHECK_FLAG));
    drop(seen);

    // delete_after_read removed the object.
    assert!(!objects.exists(&ctx, "B", "K").await.unwrap());
}
