//! Slot wiring: the Multicast Registry as a hostable pattern.
//!
//! Three slots: `registry` (TTL-capable key/value, required), `messaging`
//! (pub/sub, required), and `durability` (queue, optional; mandatory for
//! exactly-once delivery).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prism_capabilities::{
    Capability, HealthReport, Metadata, OpContext, PrismError, Result,
};
use prism_patterns::{
    InterfaceDeclaration, PatternBehavior, PatternConfig, PatternDescriptor, SlotDescriptor,
    SlotTable,
};
use serde::Deserialize;
use tracing::info;

use crate::filter::Filter;
use crate::multicast::MulticastDispatcher;
use crate::registry::{RegistryCoordinator, RegistryLimits};

/// Data-plane method names of the registry interface
pub mod methods {
    pub const REGISTER: &str = "MulticastRegistry.Register";
    pub const UNREGISTER: &str = "MulticastRegistry.Unregister";
    pub const GET: &str = "MulticastRegistry.Get";
    pub const ENUMERATE: &str = "MulticastRegistry.Enumerate";
    pub const MULTICAST: &str = "MulticastRegistry.Multicast";
}

#[derive(Debug, Deserialize)]
struct RegisterParams {
    id: String,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct IdParams {
    id: String,
}

#[derive(Debug, Deserialize)]
struct EnumerateParams {
    #[serde(default)]
    filter: Option<Filter>,
}

#[derive(Debug, Deserialize)]
struct MulticastParams {
    #[serde(default)]
    filter: Option<Filter>,
    payload: Vec<u8>,
}

struct Wired {
    coordinator: RegistryCoordinator,
    dispatcher: MulticastDispatcher,
}

/// The Multicast Registry pattern behavior
pub struct MulticastRegistryPattern {
    wired: parking_lot::RwLock<Option<Arc<Wired>>>,
}

impl MulticastRegistryPattern {
    pub fn new() -> Self {
        Self {
            wired: parking_lot::RwLock::new(None),
        }
    }

    fn wired(&self) -> Result<Arc<Wired>> {
        self.wired
            .read()
            .clone()
            .ok_or_else(|| PrismError::conflict("multicast registry not initialized"))
    }

    /// Direct access for embedders and tests; RPC clients use the data plane
    pub async fn register(
        &self,
        ctx: &OpContext,
        id: &str,
        metadata: Metadata,
        ttl_secs: Option<u64>,
    ) -> Result<()> {
        self.wired()?
            .coordinator
            .register(ctx, id, metadata, ttl_secs)
            .await
            .map(|_| ())
    }

    pub async fn unregister(&self, ctx: &OpContext, id: &str) -> Result<()> {
        self.wired()?.coordinator.unregister(ctx, id).await
    }

    pub async fn get(&self, ctx: &OpContext, id: &str) -> Result<crate::IdentityRecord> {
        self.wired()?.coordinator.get(ctx, id).await
    }

    pub async fn enumerate(
        &self,
        ctx: &OpContext,
        filter: Option<&Filter>,
    ) -> Result<Vec<crate::IdentityRecord>> {
        self.wired()?.coordinator.enumerate(ctx, filter).await
    }

    /// Resolve the filter to a target set and fan the payload out
    pub async fn multicast(
        &self,
        ctx: &OpContext,
        filter: Option<&Filter>,
        payload: &[u8],
    ) -> Result<crate::MulticastOutcome> {
        let wired = self.wired()?;
        let targets: Vec<String> = wired
            .coordinator
            .enumerate(ctx, filter)
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect();
        wired.dispatcher.dispatch(ctx, &targets, payload).await
    }
}

impl Default for MulticastRegistryPattern {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PatternBehavior for MulticastRegistryPattern {
    fn descriptor(&self) -> PatternDescriptor {
        PatternDescriptor {
            name: "multicast-registry".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            slots: vec![
                SlotDescriptor::required(
                    "registry",
                    vec![Capability::KeyValueBasic, Capability::KeyValueTtl],
                ),
                SlotDescriptor::required("messaging", vec![Capability::PubSub]),
                SlotDescriptor::optional("durability", vec![Capability::Queue]),
            ],
            interfaces: vec![InterfaceDeclaration::new(
                "MulticastRegistryInterface",
                "prism.multicast.v1.MulticastRegistry",
                "v1",
            )],
        }
    }

    async fn on_initialize(&self, slots: &SlotTable, config: &PatternConfig) -> Result<()> {
        let registry = slots.require("registry")?;
        let messaging = slots.require("messaging")?;
        let kv = registry
            .kv
            .clone()
            .ok_or_else(|| PrismError::validation("registry slot driver lacks key/value"))?;
        let pubsub = messaging
            .pubsub
            .clone()
            .ok_or_else(|| PrismError::validation("messaging slot driver lacks pub/sub"))?;
        let durability = slots.get("durability").and_then(|h| h.queue.clone());

        let messaging_config = config
            .messaging
            .as_ref()
            .ok_or_else(|| PrismError::validation("multicast registry requires a messaging section"))?;

        let limits = RegistryLimits {
            max_identities: config.max_identities,
            max_metadata_entries: config.max_metadata_entries,
            max_filter_depth: config.max_filter_depth,
            max_clauses: config.max_clauses,
            default_ttl: config.default_ttl(),
        };
        let coordinator = RegistryCoordinator::new(kv, registry.kv_scan.clone(), limits);
        let dispatcher = MulticastDispatcher::new(
            pubsub,
            durability,
            messaging_config.topic_prefix.clone(),
            messaging_config.delivery,
            messaging_config.retry_attempts,
            messaging_config.retry_delay(),
        )?;

        info!(
            delivery = ?messaging_config.delivery,
            topic_prefix = %messaging_config.topic_prefix,
            "multicast registry wired"
        );
        *self.wired.write() = Some(Arc::new(Wired {
            coordinator,
            dispatcher,
        }));
        Ok(())
    }

    async fn health(&self) -> HealthReport {
        match self.wired() {
            Ok(wired) => {
                let ctx = OpContext::with_timeout(Duration::from_secs(1));
                match wired.coordinator.count(&ctx).await {
                    Ok(count) => {
                        HealthReport::healthy().with_detail("identities", count.to_string())
                    }
                    Err(e) => HealthReport::degraded(format!("registry scan failing: {e}")),
                }
            }
            Err(_) => HealthReport::unhealthy("not initialized"),
        }
    }

    async fn handle_data(
        &self,
        ctx: &OpContext,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<serde_json::Value>> {
        match method {
            methods::REGISTER => {
                let p: RegisterParams = serde_json::from_value(params)?;
                let record = self
                    .wired()?
                    .coordinator
                    .register(ctx, &p.id, p.metadata, p.ttl_secs)
                    .await?;
                Ok(Some(serde_json::to_value(record)?))
            }
            methods::UNREGISTER => {
                let p: IdParams = serde_json::from_value(params)?;
                self.unregister(ctx, &p.id).await?;
                Ok(Some(serde_json::json!({})))
            }
            methods::GET => {
                let p: IdParams = serde_json::from_value(params)?;
                let record = self.get(ctx, &p.id).await?;
                Ok(Some(serde_json::to_value(record)?))
            }
            methods::ENUMERATE => {
                let p: EnumerateParams = serde_json::from_value(params)?;
                let records = self.enumerate(ctx, p.filter.as_ref()).await?;
                Ok(Some(serde_json::to_value(records)?))
            }
            methods::MULTICAST => {
                let p: MulticastParams = serde_json::from_value(params)?;
                let outcome = self.multicast(ctx, p.filter.as_ref(), &p.payload).await?;
                Ok(Some(serde_json::to_value(outcome)?))
            }
            _ => Ok(None),
        }
    }
}
