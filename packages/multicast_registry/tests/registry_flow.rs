//! Multicast registry end-to-end on the in-memory driver, plus delivery
//! semantics against a controllable pub/sub stub.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prism_capabilities::{
    Metadata, OpContext, PrismError, PubSub, Result, Subscription, Value,
};
use prism_drivers::DriverSpec;
use prism_multicast_registry::{Filter, MulticastDispatcher, MulticastRegistryPattern};
use prism_patterns::{DeliveryMode, MessagingConfig, PatternConfig, PatternRuntime};

fn registry_config() -> PatternConfig {
    let mut config = PatternConfig::new("multicast-registry");
    config.registry = Some(DriverSpec::new("memory"));
    config.messaging = Some(MessagingConfig {
        kind: "memory".to_string(),
        servers: Vec::new(),
        options: BTreeMap::new(),
        topic_prefix: "registry.".to_string(),
        delivery: DeliveryMode::AtMostOnce,
        retry_attempts: 3,
        retry_delay_ms: 10,
    });
    config.max_identities = 100;
    config
}

async fn started_pattern(
    config: PatternConfig,
) -> (Arc<MulticastRegistryPattern>, Arc<PatternRuntime>) {
    let pattern = Arc::new(MulticastRegistryPattern::new());
    let runtime = Arc::new(PatternRuntime::new(pattern.clone()));
    runtime.initialize("multicast-registry", config).await.unwrap();
    runtime.start().await.unwrap();
    (pattern, runtime)
}

fn online_eng() -> Metadata {
    Metadata::from([
        ("status".to_string(), Value::Str("online".into())),
        ("room".to_string(), Value::Str("eng".into())),
    ])
}

#[tokio::test]
async fn register_then_get_returns_the_same_metadata() {
    let (pattern, _runtime) = started_pattern(registry_config()).await;
    let ctx = OpContext::new();
    pattern.register(&ctx, "a", online_eng(), None).await.unwrap();

    let record = pattern.get(&ctx, "a").await.unwrap();
    assert_eq!(record.metadata, online_eng());
    assert!(record.expires_at.is_none());
}

#[tokio::test]
async fn reregistration_overwrites_metadata_and_ttl() {
    let (pattern, _runtime) = started_pattern(registry_config()).await;
    let ctx = OpContext::new();
    pattern.register(&ctx, "a", online_eng(), None).await.unwrap();

    let mut updated = online_eng();
    updated.insert("status".to_string(), Value::Str("offline".into()));
    pattern.register(&ctx, "a", updated.clone(), Some(60)).await.unwrap();

    let record = pattern.get(&ctx, "a").await.unwrap();
    assert_eq!(record.metadata, updated);
    assert_eq!(record.ttl_secs, Some(60));
    assert!(record.expires_at.is_some());
}

#[tokio::test]
async fn unregister_is_idempotent_and_leaves_no_ghost() {
    let (pattern, _runtime) = started_pattern(registry_config()).await;
    let ctx = OpContext::new();
    pattern.register(&ctx, "a", online_eng(), Some(60)).await.unwrap();
    pattern.unregister(&ctx, "a").await.unwrap();
    pattern.unregister(&ctx, "a").await.unwrap();
    assert!(pattern.get(&ctx, "a").await.unwrap_err().is_not_found());

    // Register after unregister is a fresh record.
    pattern.register(&ctx, "a", Metadata::new(), None).await.unwrap();
    let record = pattern.get(&ctx, "a").await.unwrap();
    assert!(record.metadata.is_empty());
    assert_eq!(record.ttl_secs, None);
}

#[tokio::test]
async fn ttl_expiry_hides_the_identity_from_get_and_enumerate() {
    let (pattern, _runtime) = started_pattern(registry_config()).await;
    let ctx = OpContext::new();
    pattern.register(&ctx, "x", online_eng(), Some(1)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(pattern.get(&ctx, "x").await.is_ok());

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(pattern.get(&ctx, "x").await.unwrap_err().is_not_found());
    let all = pattern.enumerate(&ctx, None).await.unwrap();
    assert!(all.is_empty());
}

#[tokio::test]
async fn multicast_reaches_only_the_filtered_set() {
    let (pattern, runtime) = started_pattern(registry_config()).await;
    let ctx = OpContext::new();

    pattern.register(&ctx, "a", online_eng(), None).await.unwrap();
    let mut sales = online_eng();
    sales.insert("room".to_string(), Value::Str("sales".into()));
    pattern.register(&ctx, "b", sales, None).await.unwrap();
    let mut offline = online_eng();
    offline.insert("status".to_string(), Value::Str("offline".into()));
    pattern.register(&ctx, "c", offline, None).await.unwrap();

    // Subscribe on each identity's topic through the messaging slot.
    let slots = runtime.slots().await;
    let pubsub = slots.require("messaging").unwrap().pubsub.clone().unwrap();
    let mut sub_a = pubsub.subscribe(&ctx, "registry.a", "watch-a").await.unwrap();
    let mut sub_b = pubsub.subscribe(&ctx, "registry.b", "watch-b").await.unwrap();
    let mut sub_c = pubsub.subscribe(&ctx, "registry.c", "watch-c").await.unwrap();

    let filter = Filter::and(vec![
        Filter::eq("status", "online"),
        Filter::eq("room", "eng"),
    ]);
    let outcome = pattern
        .multicast(&ctx, Some(&filter), &[0xDE, 0xAD, 0xBE, 0xEF])
        .await
        .unwrap();
    assert_eq!(outcome.target_count, 1);
    assert_eq!(outcome.delivered_count, 1);
    assert_eq!(outcome.failed_count, 0);

    let delivered = sub_a.next().await.unwrap();
    assert_eq!(delivered.payload, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    assert!(sub_b.try_next().is_none());
    assert!(sub_c.try_next().is_none());
}

#[tokio::test]
async fn filter_depth_guard_rejects_at_the_boundary() {
    let (pattern, _runtime) = started_pattern(registry_config()).await;
    let ctx = OpContext::new();

    fn nested(levels: usize) -> Filter {
        let mut f = Filter::eq("x", 1i64);
        for _ in 1..levels {
            f = Filter::and(vec![f]);
        }
        f
    }

    assert!(pattern.enumerate(&ctx, Some(&nested(5))).await.is_ok());
    let err = pattern.enumerate(&ctx, Some(&nested(6))).await.unwrap_err();
    assert_eq!(err.kind(), prism_capabilities::ErrorKind::Validation);
}

#[tokio::test]
async fn identity_cap_is_enforced_but_overwrites_pass() {
    let mut config = registry_config();
    config.max_identities = 2;
    let (pattern, _runtime) = started_pattern(config).await;
    let ctx = OpContext::new();

    pattern.register(&ctx, "a", Metadata::new(), None).await.unwrap();
    pattern.register(&ctx, "b", Metadata::new(), None).await.unwrap();
    let err = pattern
        .register(&ctx, "c", Metadata::new(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), prism_capabilities::ErrorKind::CapacityExhausted);
    assert!(err.retry_after().is_some());

    // Overwriting an existing identity never hits the cap.
    pattern.register(&ctx, "a", online_eng(), None).await.unwrap();
}

#[tokio::test]
async fn exactly_once_without_durability_is_rejected_at_initialize() {
    let mut config = registry_config();
    if let Some(messaging) = config.messaging.as_mut() {
        messaging.delivery = DeliveryMode::ExactlyOnce;
    }
    let pattern = Arc::new(MulticastRegistryPattern::new());
    let runtime = PatternRuntime::new(pattern);
    let err = runtime
        .initialize("multicast-registry", config)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), prism_capabilities::ErrorKind::Validation);
}

// ---- delivery semantics against a controllable stub ----------------------

/// Fails the first `failures` publishes per topic with a transient error
struct FlakyPubSub {
    failures: u32,
    attempts: AtomicU32,
    delivered: parking_lot::Mutex<Vec<String>>,
}

impl FlakyPubSub {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            attempts: AtomicU32::new(0),
            delivered: parking_lot::Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl PubSub for FlakyPubSub {
    async fn publish(
        &self,
        _ctx: &OpContext,
        topic: &str,
        _payload: Vec<u8>,
        _metadata: BTreeMap<String, String>,
    ) -> Result<String> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(PrismError::transient("broker unreachable"));
        }
        self.delivered.lock().push(topic.to_string());
        Ok(format!("m-{attempt}"))
    }

    async fn subscribe(
        &self,
        _ctx: &OpContext,
        topic: &str,
        subscriber_id: &str,
    ) -> Result<Subscription> {
        let (_tx, sub) = prism_capabilities::subscription_channel(topic, subscriber_id, 1);
        Ok(sub)
    }

    async fn unsubscribe(&self, _ctx: &OpContext, _topic: &str, _subscriber_id: &str) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn at_most_once_counts_partial_failures_without_aborting() {
    // Every publish fails; the multicast still returns an outcome.
    let pubsub = FlakyPubSub::new(u32::MAX);
    let dispatcher = MulticastDispatcher::new(
        pubsub,
        None,
        "t.",
        DeliveryMode::AtMostOnce,
        0,
        Duration::from_millis(1),
    )
    .unwrap();
    let ctx = OpContext::new();
    let outcome = dispatcher
        .dispatch(&ctx, &["a".into(), "b".into(), "c".into()], b"payload")
        .await
        .unwrap();
    assert_eq!(outcome.target_count, 3);
    assert_eq!(outcome.delivered_count, 0);
    assert_eq!(outcome.failed_count, 3);
    assert_eq!(outcome.failures.len(), 3);
}

#[tokio::test]
async fn at_least_once_retries_transient_errors() {
    let pubsub = FlakyPubSub::new(2);
    let dispatcher = MulticastDispatcher::new(
        pubsub.clone(),
        None,
        "t.",
        DeliveryMode::AtLeastOnce,
        3,
        Duration::from_millis(1),
    )
    .unwrap();
    let ctx = OpContext::new();
    let outcome = dispatcher
        .dispatch(&ctx, &["a".into()], b"payload")
        .await
        .unwrap();
    assert_eq!(outcome.delivered_count, 1);
    assert_eq!(pubsub.attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn cancelled_multicast_skips_unstarted_targets() {
    let pubsub = FlakyPubSub::new(0);
    let dispatcher = MulticastDispatcher::new(
        pubsub,
        None,
        "t.",
        DeliveryMode::AtMostOnce,
        0,
        Duration::from_millis(1),
    )
    .unwrap();
    let ctx = OpContext::new();
    ctx.cancel();
    let outcome = dispatcher
        .dispatch(&ctx, &["a".into(), "b".into()], b"payload")
        .await
        .unwrap();
    assert_eq!(outcome.delivered_count, 0);
    assert_eq!(outcome.failed_count, 2);
}
