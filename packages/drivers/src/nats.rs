//! NATS driver: pub/sub over core NATS subjects.
//!
//! Core NATS gives fire-and-forget fan-out, which matches the at-most-once
//! contract of the PubSub capability; queue-with-ack semantics are not
//! offered by this adapter. Message metadata travels as NATS headers with
//! the message id under `prism-message-id`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use prism_capabilities::{
    subscription_channel, Capability, DrainSummary, DriverHandle, DriverLifecycle, HealthReport,
    Message, OpContext, PrismError, PubSub, Result, Subscription, DEFAULT_CHANNEL_CAPACITY,
};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

const MESSAGE_ID_HEADER: &str = "prism-message-id";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const CAPABILITIES: &[Capability] = &[Capability::PubSub];

/// PubSub adapter over a core NATS connection
pub struct NatsDriver {
    client: OnceCell<async_nats::Client>,
    /// `{topic}\n{subscriber_id}` -> bridge-task cancellation
    bridges: DashMap<String, CancellationToken>,
    channel_capacity: usize,
    stopped: AtomicBool,
}

impl NatsDriver {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            client: OnceCell::new(),
            bridges: DashMap::new(),
            channel_capacity,
            stopped: AtomicBool::new(false),
        }
    }

    fn client(&self) -> Result<&async_nats::Client> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(PrismError::conflict("nats driver is stopped"));
        }
        self.client
            .get()
            .ok_or_else(|| PrismError::conflict("nats driver not initialized"))
    }

    fn bridge_key(topic: &str, subscriber_id: &str) -> String {
        format!("{topic}\n{subscriber_id}")
    }
}

#[async_trait]
impl DriverLifecycle for NatsDriver {
    fn name(&self) -> &str {
        "nats"
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    async fn initialize(&self, options: &BTreeMap<String, String>) -> Result<()> {
        if self.client.get().is_some() {
            return Ok(());
        }
        let url = options
            .get("servers")
            .or_else(|| options.get("url"))
            .ok_or_else(|| PrismError::validation("nats driver requires a servers option"))?
            .clone();
        let client = tokio::time::timeout(CONNECT_TIMEOUT, async_nats::connect(url.clone()))
            .await
            .map_err(|_| PrismError::timeout(format!("nats connect {url}")))?
            .map_err(|e| PrismError::transient(format!("nats connect {url}: {e}")))?;
        self.client
            .set(client)
            .map_err(|_| PrismError::conflict("nats driver already initialized"))?;
        debug!(%url, "nats driver connected");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.client().map(|_| ())
    }

    async fn drain(&self, _ctx: &OpContext) -> Result<DrainSummary> {
        // Publishes are fire-and-forget; flush what is buffered.
        if let Ok(client) = self.client() {
            if let Err(e) = client.flush().await {
                warn!("nats flush during drain failed: {e}");
            }
        }
        Ok(DrainSummary::default())
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        for entry in self.bridges.iter() {
            entry.value().cancel();
        }
        self.bridges.clear();
        Ok(())
    }

    async fn health(&self) -> HealthReport {
        match self.client.get() {
            None => HealthReport::unhealthy("not initialized"),
            Some(client) => match client.connection_state() {
                async_nats::connection::State::Connected => HealthReport::healthy(),
                async_nats::connection::State::Pending => {
                    HealthReport::degraded("reconnecting to nats")
                }
                async_nats::connection::State::Disconnected => {
                    HealthReport::unhealthy("disconnected from nats")
                }
            },
        }
    }
}

#[async_trait]
impl PubSub for NatsDriver {
    async fn publish(
        &self,
        ctx: &OpContext,
        topic: &str,
        payload: Vec<u8>,
        metadata: BTreeMap<String, String>,
    ) -> Result<String> {
        let client = self.client()?;
        let id = Uuid::new_v4().to_string();

        let mut headers = async_nats::HeaderMap::new();
        headers.insert(MESSAGE_ID_HEADER, id.as_str());
        for (key, value) in &metadata {
            headers.insert(key.as_str(), value.as_str());
        }

        ctx.run(
            "nats publish",
            client.publish_with_headers(topic.to_string(), headers, payload.into()),
        )
        .await?
        .map_err(|e| PrismError::transient(format!("nats publish to {topic}: {e}")))?;
        Ok(id)
    }

    async fn subscribe(
        &self,
        ctx: &OpContext,
        topic: &str,
        subscriber_id: &str,
    ) -> Result<Subscription> {
        let client = self.client()?;
        let mut nats_sub = ctx
            .run("nats subscribe", client.subscribe(topic.to_string()))
            .await?
            .map_err(|e| PrismError::transient(format!("nats subscribe {topic}: {e}")))?;

        let (sender, subscription) =
            subscription_channel(topic, subscriber_id, self.channel_capacity);
        let token = CancellationToken::new();
        let key = Self::bridge_key(topic, subscriber_id);
        if let Some(previous) = self.bridges.insert(key, token.clone()) {
            previous.cancel();
        }

        let topic_name = topic.to_string();
        tokio::spawn(async move {
            loop {
                let incoming = tokio::select! {
                    _ = token.cancelled() => break,
                    incoming = nats_sub.next() => incoming,
                };
                let Some(incoming) = incoming else { break };

                let mut metadata = BTreeMap::new();
                let mut id = None;
                if let Some(headers) = &incoming.headers {
                    for (name, values) in headers.iter() {
                        let value = values
                            .first()
                            .map(|v| v.to_string())
                            .unwrap_or_default();
                        if name.to_string() == MESSAGE_ID_HEADER {
                            id = Some(value);
                        } else {
                            metadata.insert(name.to_string(), value);
                        }
                    }
                }
                let message = Message {
                    id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                    topic: incoming.subject.to_string(),
                    payload: incoming.payload.to_vec(),
                    metadata,
                    published_at: Utc::now(),
                };
                // Bounded channel, at-most-once: drop on full.
                sender.try_deliver(message);
                if sender.is_closed() {
                    break;
                }
            }
            let _ = nats_sub.unsubscribe().await;
            debug!(topic = %topic_name, "nats bridge task exited");
        });

        Ok(subscription)
    }

    async fn unsubscribe(&self, _ctx: &OpContext, topic: &str, subscriber_id: &str) -> Result<()> {
        if let Some((_, token)) = self.bridges.remove(&Self::bridge_key(topic, subscriber_id)) {
            token.cancel();
        }
        Ok(())
    }
}

/// Build a handle exposing the NATS driver's pub/sub capability
pub fn nats_handle() -> DriverHandle {
    let driver = std::sync::Arc::new(NatsDriver::new(DEFAULT_CHANNEL_CAPACITY));
    DriverHandle::new(driver.clone()).with_pubsub(driver)
}
