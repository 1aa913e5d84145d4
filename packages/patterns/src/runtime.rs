//! The generic pattern host.
//!
//! A [`PatternRuntime`] owns one pattern instance: its configuration, its
//! bound drivers, and both planes. The lifecycle contract mirrors the
//! launcher's expectations:
//!
//! - `Initialize` validates config, constructs and binds drivers, and is
//!   idempotent on an identical config (a different config is a conflict).
//! - `Start` opens the data-plane listener and brings workers up; no-op
//!   when already started.
//! - `HealthCheck` answers in bounded time with the worst constituent
//!   status.
//! - `Drain` stops intake, waits for in-flight operations, and reports
//!   drained/aborted counts.
//! - `Stop` releases everything and is idempotent.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prism_capabilities::{
    DrainSummary, HealthReport, HealthStatus, OpContext, PrismError, Result,
};
use prism_drivers::create_driver;
use prism_rpc::{RpcServer, RpcService};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::PatternConfig;
use crate::data_plane::DataPlaneService;
use crate::slots::{bind_slots, NamedCandidate, SlotDescriptor, SlotTable};

/// Health checks must answer within this bound
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// An interface a pattern exposes on its data plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDeclaration {
    pub name: String,
    pub proto_identifier: String,
    pub version: String,
}

impl InterfaceDeclaration {
    pub fn new(name: &str, proto_identifier: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            proto_identifier: proto_identifier.to_string(),
            version: version.to_string(),
        }
    }
}

/// What a pattern is: its slots and the interfaces it serves
#[derive(Debug, Clone)]
pub struct PatternDescriptor {
    pub name: String,
    pub version: String,
    pub slots: Vec<SlotDescriptor>,
    pub interfaces: Vec<InterfaceDeclaration>,
}

/// The pattern-specific part hosted by a [`PatternRuntime`]
#[async_trait]
pub trait PatternBehavior: Send + Sync {
    fn descriptor(&self) -> PatternDescriptor;

    /// Called once slots are bound, before the pattern is started
    async fn on_initialize(&self, slots: &SlotTable, config: &PatternConfig) -> Result<()>;

    async fn on_start(&self) -> Result<()> {
        Ok(())
    }

    async fn on_drain(&self, _ctx: &OpContext) -> Result<DrainSummary> {
        Ok(DrainSummary::default())
    }

    async fn on_stop(&self) -> Result<()> {
        Ok(())
    }

    async fn health(&self) -> HealthReport {
        HealthReport::healthy()
    }

    /// Pattern-specific data-plane methods. `Ok(None)` falls through to the
    /// generic capability dispatch.
    async fn handle_data(
        &self,
        _ctx: &OpContext,
        _method: &str,
        _params: serde_json::Value,
    ) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Initialized,
    Running,
    Draining,
    Stopped,
}

struct RuntimeInner {
    phase: Phase,
    config: Option<PatternConfig>,
    slots: SlotTable,
    data_addr: Option<std::net::SocketAddr>,
    data_shutdown: Option<CancellationToken>,
}

/// Tracks open data-plane operations so Drain can report honest counts
pub struct InFlightGauge {
    open: AtomicU64,
    completed: AtomicU64,
    draining: AtomicBool,
    idle: Notify,
}

impl InFlightGauge {
    pub fn new() -> Self {
        Self {
            open: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            draining: AtomicBool::new(false),
            idle: Notify::new(),
        }
    }

    /// Begin an operation; refused while draining
    pub fn begin(self: &Arc<Self>) -> Result<OpGuard> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(PrismError::transient("draining, not accepting new requests"));
        }
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(OpGuard {
            gauge: self.clone(),
        })
    }

    pub fn open_count(&self) -> u64 {
        self.open.load(Ordering::SeqCst)
    }

    fn start_draining(&self) -> u64 {
        self.draining.store(true, Ordering::SeqCst);
        self.completed.load(Ordering::SeqCst)
    }

    fn stop_draining(&self) {
        self.draining.store(false, Ordering::SeqCst);
    }

    /// Wait until no operations are open or the context expires. Returns
    /// (completed during the wait, still open).
    async fn await_idle(&self, ctx: &OpContext, completed_at_start: u64) -> (u64, u64) {
        loop {
            let open = self.open.load(Ordering::SeqCst);
            if open == 0 || ctx.expired() || ctx.is_cancelled() {
                let drained = self
                    .completed
                    .load(Ordering::SeqCst)
                    .saturating_sub(completed_at_start);
                return (drained, open);
            }
            let wait = ctx
                .remaining()
                .unwrap_or(Duration::from_millis(50))
                .min(Duration::from_millis(50));
            tokio::select! {
                _ = self.idle.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

impl Default for InFlightGauge {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for one in-flight operation
pub struct OpGuard {
    gauge: Arc<InFlightGauge>,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.gauge.completed.fetch_add(1, Ordering::SeqCst);
        if self.gauge.open.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.gauge.idle.notify_waiters();
        }
    }
}

/// Host for one pattern instance
pub struct PatternRuntime {
    behavior: Arc<dyn PatternBehavior>,
    descriptor: PatternDescriptor,
    inner: tokio::sync::RwLock<RuntimeInner>,
    in_flight: Arc<InFlightGauge>,
    data_bind: String,
}

impl PatternRuntime {
    pub fn new(behavior: Arc<dyn PatternBehavior>) -> Self {
        Self::with_data_bind(behavior, "127.0.0.1:0")
    }

    pub fn with_data_bind(behavior: Arc<dyn PatternBehavior>, data_bind: &str) -> Self {
        let descriptor = behavior.descriptor();
        Self {
            behavior,
            descriptor,
            inner: tokio::sync::RwLock::new(RuntimeInner {
                phase: Phase::Pending,
                config: None,
                slots: SlotTable::default(),
                data_addr: None,
                data_shutdown: None,
            }),
            in_flight: Arc::new(InFlightGauge::new()),
            data_bind: data_bind.to_string(),
        }
    }

    pub fn descriptor(&self) -> &PatternDescriptor {
        &self.descriptor
    }

    pub fn interfaces(&self) -> Vec<InterfaceDeclaration> {
        self.descriptor.interfaces.clone()
    }

    pub async fn slots(&self) -> SlotTable {
        self.inner.read().await.slots.clone()
    }

    pub async fn data_address(&self) -> Option<std::net::SocketAddr> {
        self.inner.read().await.data_addr
    }

    /// Validate config, construct drivers, bind slots. Idempotent for an
    /// identical config; a different config is `AlreadyInitialized`.
    pub async fn initialize(&self, name: &str, config: PatternConfig) -> Result<()> {
        if name != self.descriptor.name {
            return Err(PrismError::validation(format!(
                "pattern name mismatch: runtime hosts {}, got {name}",
                self.descriptor.name
            )));
        }

        let mut inner = self.inner.write().await;
        match inner.phase {
            Phase::Stopped => return Err(PrismError::conflict("pattern is stopped")),
            Phase::Pending => {}
            // Already initialized: same config is fine, different is not.
            _ => {
                return if inner.config.as_ref() == Some(&config) {
                    Ok(())
                } else {
                    Err(PrismError::conflict("already initialized with a different config"))
                };
            }
        }

        let mut candidates = Vec::new();
        for (slot_name, spec) in config.slot_specs() {
            let handle = create_driver(&spec)?;
            handle.lifecycle.initialize(&spec.options).await?;
            candidates.push(NamedCandidate {
                name: slot_name,
                handle,
            });
        }

        let slots = bind_slots(&self.descriptor.slots, &candidates)?;
        self.behavior.on_initialize(&slots, &config).await?;

        info!(
            pattern = %self.descriptor.name,
            slots = slots.len(),
            "pattern initialized"
        );
        inner.slots = slots;
        inner.config = Some(config);
        inner.phase = Phase::Initialized;
        Ok(())
    }

    /// Open the data plane and start workers. No-op when already running.
    pub async fn start(&self) -> Result<std::net::SocketAddr> {
        let mut inner = self.inner.write().await;
        match inner.phase {
            Phase::Running => {
                return inner
                    .data_addr
                    .ok_or_else(|| PrismError::fatal("running without a data-plane address"))
            }
            Phase::Initialized => {}
            Phase::Pending => return Err(PrismError::conflict("not initialized")),
            Phase::Draining | Phase::Stopped => {
                return Err(PrismError::conflict("pattern is shutting down"))
            }
        }

        for (name, handle) in inner.slots.iter() {
            handle
                .lifecycle
                .start()
                .await
                .map_err(|e| PrismError::fatal(format!("starting driver for slot {name}: {e}")))?;
        }
        self.behavior.on_start().await?;

        let service = Arc::new(DataPlaneService::new(
            self.behavior.clone(),
            inner.slots.clone(),
            self.in_flight.clone(),
        ));
        let server = RpcServer::bind(&self.data_bind, service).await?;
        let (addr, shutdown) = server.spawn()?;

        info!(pattern = %self.descriptor.name, %addr, "data plane listening");
        inner.data_addr = Some(addr);
        inner.data_shutdown = Some(shutdown);
        inner.phase = Phase::Running;
        Ok(addr)
    }

    /// Bounded health aggregation across drivers and the behavior
    pub async fn health_check(&self) -> HealthReport {
        let (phase, slots) = {
            let inner = self.inner.read().await;
            (inner.phase, inner.slots.clone())
        };
        if phase == Phase::Stopped {
            return HealthReport::unhealthy("stopped");
        }

        let mut report = HealthReport::healthy();
        for (name, handle) in slots.iter() {
            let driver_report =
                match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, handle.lifecycle.health()).await {
                    Ok(r) => r,
                    Err(_) => HealthReport::unhealthy("health check timed out"),
                };
            report.merge(name, &driver_report);
        }
        let behavior_report =
            match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, self.behavior.health()).await {
                Ok(r) => r,
                Err(_) => HealthReport::unhealthy("health check timed out"),
            };
        report.merge(&self.descriptor.name, &behavior_report);
        if phase == Phase::Draining {
            report.status = report.status.max(HealthStatus::Degraded);
            report.message = "draining".to_string();
        }
        report
    }

    /// Stop intake, finish in-flight work within `timeout`
    pub async fn drain(&self, timeout: Duration, reason: &str) -> Result<DrainSummary> {
        {
            let mut inner = self.inner.write().await;
            match inner.phase {
                Phase::Running => inner.phase = Phase::Draining,
                // Draining something not running is trivially complete.
                _ => return Ok(DrainSummary::default()),
            }
        }
        info!(pattern = %self.descriptor.name, reason, "drain started");

        let ctx = OpContext::with_timeout(timeout);
        let completed_at_start = self.in_flight.start_draining();
        let (drained, aborted) = self.in_flight.await_idle(&ctx, completed_at_start).await;

        let mut summary = DrainSummary {
            drained_operations: drained,
            aborted_operations: aborted,
        };
        match self.behavior.on_drain(&ctx).await {
            Ok(s) => summary.merge(s),
            Err(e) => warn!("behavior drain failed: {e}"),
        }
        let slots = self.inner.read().await.slots.clone();
        for (name, handle) in slots.iter() {
            match handle.lifecycle.drain(&ctx).await {
                Ok(s) => summary.merge(s),
                Err(e) => warn!("driver drain for slot {name} failed: {e}"),
            }
        }
        info!(
            pattern = %self.descriptor.name,
            drained = summary.drained_operations,
            aborted = summary.aborted_operations,
            "drain finished"
        );
        Ok(summary)
    }

    /// Release all resources. Safe after Drain, idempotent.
    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.phase == Phase::Stopped {
            return Ok(());
        }

        if let Some(shutdown) = inner.data_shutdown.take() {
            shutdown.cancel();
        }
        if let Err(e) = self.behavior.on_stop().await {
            warn!("behavior stop failed: {e}");
        }
        for (name, handle) in inner.slots.iter() {
            if let Err(e) = handle.lifecycle.stop().await {
                warn!("driver stop for slot {name} failed: {e}");
            }
        }
        self.in_flight.stop_draining();
        inner.phase = Phase::Stopped;
        info!(pattern = %self.descriptor.name, "pattern stopped");
        Ok(())
    }
}

// ---- Lifecycle RPC surface -------------------------------------------------

/// Method names of the `PatternLifecycle` service
pub mod lifecycle_methods {
    pub const INITIALIZE: &str = "PatternLifecycle.Initialize";
    pub const START: &str = "PatternLifecycle.Start";
    pub const HEALTH_CHECK: &str = "PatternLifecycle.HealthCheck";
    pub const DRAIN: &str = "PatternLifecycle.Drain";
    pub const STOP: &str = "PatternLifecycle.Stop";
    pub const GET_INTERFACES: &str = "PatternLifecycle.GetInterfaceDeclarations";
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InitializeParams {
    pub name: String,
    #[serde(default)]
    pub version: String,
    pub config: PatternConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InitializeReply {
    pub success: bool,
    pub interfaces: Vec<InterfaceDeclaration>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartReply {
    pub success: bool,
    pub data_endpoint: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DrainParams {
    pub timeout_secs: u64,
    #[serde(default)]
    pub reason: String,
}

/// `PatternLifecycle` served over RPC, the child side of the control plane
pub struct LifecycleService {
    runtime: Arc<PatternRuntime>,
}

impl LifecycleService {
    pub fn new(runtime: Arc<PatternRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl RpcService for LifecycleService {
    async fn handle(
        &self,
        _ctx: &OpContext,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        match method {
            lifecycle_methods::INITIALIZE => {
                let params: InitializeParams = serde_json::from_value(params)?;
                self.runtime.initialize(&params.name, params.config).await?;
                Ok(serde_json::to_value(InitializeReply {
                    success: true,
                    interfaces: self.runtime.interfaces(),
                })?)
            }
            lifecycle_methods::START => {
                let addr = self.runtime.start().await?;
                Ok(serde_json::to_value(StartReply {
                    success: true,
                    data_endpoint: addr.to_string(),
                })?)
            }
            lifecycle_methods::HEALTH_CHECK => {
                Ok(serde_json::to_value(self.runtime.health_check().await)?)
            }
            lifecycle_methods::DRAIN => {
                let params: DrainParams = serde_json::from_value(params)?;
                let summary = self
                    .runtime
                    .drain(Duration::from_secs(params.timeout_secs), &params.reason)
                    .await?;
                Ok(serde_json::to_value(summary)?)
            }
            lifecycle_methods::STOP => {
                self.runtime.stop().await?;
                Ok(serde_json::json!({}))
            }
            lifecycle_methods::GET_INTERFACES => {
                Ok(serde_json::to_value(self.runtime.interfaces())?)
            }
            other => Err(PrismError::not_found(format!("unknown method: {other}"))),
        }
    }
}
