//! Control-plane RPC surface of the launcher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prism_capabilities::{OpContext, PrismError, Result};
use prism_patterns::PatternConfig;
use prism_rpc::RpcService;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::process::IsolationScope;
use crate::supervisor::{LaunchRequest, Launcher, ListFilter};

/// Method names of the `PatternLauncher` service
pub mod launcher_methods {
    pub const LAUNCH: &str = "PatternLauncher.LaunchPattern";
    pub const TERMINATE: &str = "PatternLauncher.TerminatePattern";
    pub const STATUS: &str = "PatternLauncher.GetProcessStatus";
    pub const LIST: &str = "PatternLauncher.ListProcesses";
    pub const HEALTH: &str = "PatternLauncher.Health";
    pub const WATCH_HEALTH: &str = "PatternLauncher.WatchHealth";
}

#[derive(Debug, Deserialize)]
struct LaunchParams {
    pattern_name: String,
    #[serde(default = "default_isolation")]
    isolation: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    config: PatternConfig,
}

fn default_isolation() -> String {
    "none".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LaunchReply {
    pub process_id: String,
    pub address: Option<String>,
    pub state: String,
    pub healthy: bool,
}

#[derive(Debug, Deserialize)]
struct TerminateParams {
    process_id: String,
    #[serde(default)]
    grace_period_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StatusParams {
    process_id: String,
}

#[derive(Debug, Deserialize, Default)]
struct HealthParams {
    #[serde(default)]
    include_processes: bool,
}

#[derive(Debug, Deserialize)]
struct WatchHealthParams {
    #[serde(default = "default_watch_interval")]
    interval_secs: u64,
}

fn default_watch_interval() -> u64 {
    5
}

/// `PatternLauncher` served over RPC
pub struct LauncherService {
    launcher: Arc<Launcher>,
}

impl LauncherService {
    pub fn new(launcher: Arc<Launcher>) -> Self {
        Self { launcher }
    }
}

#[async_trait]
impl RpcService for LauncherService {
    async fn handle(
        &self,
        _ctx: &OpContext,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        match method {
            launcher_methods::LAUNCH => {
                let p: LaunchParams = serde_json::from_value(params)?;
                let scope = IsolationScope::from_parts(
                    &p.isolation,
                    p.namespace.as_deref(),
                    p.session_id.as_deref(),
                )?;
                let record = self
                    .launcher
                    .launch(LaunchRequest {
                        pattern_name: p.pattern_name,
                        scope,
                        config: p.config,
                    })
                    .await?;
                Ok(serde_json::to_value(LaunchReply {
                    process_id: record.process_id,
                    address: record.data_plane_address,
                    state: record.state.to_string(),
                    healthy: record.healthy,
                })?)
            }
            launcher_methods::TERMINATE => {
                let p: TerminateParams = serde_json::from_value(params)?;
                let grace = p
                    .grace_period_secs
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| self.launcher.config().default_grace_period());
                self.launcher.terminate(&p.process_id, grace).await?;
                Ok(serde_json::json!({}))
            }
            launcher_methods::STATUS => {
                let p: StatusParams = serde_json::from_value(params)?;
                let record = self
                    .launcher
                    .record(&p.process_id)
                    .await
                    .ok_or_else(|| PrismError::not_found(format!("process {}", p.process_id)))?;
                Ok(serde_json::to_value(record)?)
            }
            launcher_methods::LIST => {
                let filter: ListFilter = serde_json::from_value(params).unwrap_or_default();
                Ok(serde_json::to_value(self.launcher.list(&filter).await)?)
            }
            launcher_methods::HEALTH => {
                let p: HealthParams = serde_json::from_value(params).unwrap_or_default();
                Ok(serde_json::to_value(
                    self.launcher.health(p.include_processes).await,
                )?)
            }
            other => Err(PrismError::not_found(format!("unknown method: {other}"))),
        }
    }

    fn is_stream(&self, method: &str) -> bool {
        method == launcher_methods::WATCH_HEALTH
    }

    /// Pushes aggregate health snapshots until the watcher disconnects
    async fn handle_stream(
        &self,
        _ctx: &OpContext,
        method: &str,
        params: serde_json::Value,
    ) -> Result<mpsc::Receiver<serde_json::Value>> {
        if method != launcher_methods::WATCH_HEALTH {
            return Err(PrismError::not_found(format!("unknown stream method: {method}")));
        }
        let p: WatchHealthParams =
            serde_json::from_value(params).unwrap_or(WatchHealthParams {
                interval_secs: default_watch_interval(),
            });
        let interval = Duration::from_secs(p.interval_secs.max(1));
        let launcher = self.launcher.clone();
        let shutdown = launcher.shutdown_token();
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tick.tick() => {}
                }
                let health = launcher.health(false).await;
                let Ok(frame) = serde_json::to_value(&health) else {
                    continue;
                };
                if tx.send(frame).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}
