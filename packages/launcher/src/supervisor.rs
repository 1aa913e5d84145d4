//! The supervisor: inventory, spawn/terminate, health polling, restarts.
//!
//! Transitions are serialized per process id through a lane mutex; the
//! inventory itself sits behind a read/write lock because status reads are
//! frequent and spawns are rare. Every failure path funnels through
//! [`Launcher::handle_failure_locked`], which applies the restart policy:
//! exponential backoff, capped, with a sliding-window crash budget.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use prism_capabilities::{PrismError, Result};
use prism_patterns::runtime::lifecycle_methods;
use prism_patterns::runtime::{DrainParams, InitializeParams, InitializeReply, StartReply};
use prism_patterns::PatternConfig;
use prism_rpc::RpcClient;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::LauncherConfig;
use crate::persistence::{self, PersistedProcess};
use crate::process::{IsolationScope, ProcessRecord, ProcessState};
use crate::spawner::{ChildHandle, ExitOutcome, ProcessSpawner, SpawnRequest};

const HEALTH_CALL_TIMEOUT: Duration = Duration::from_secs(2);

/// A launch as accepted by the control plane
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub pattern_name: String,
    pub scope: IsolationScope,
    pub config: PatternConfig,
}

/// Inventory filter for `ListProcesses`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilter {
    #[serde(default)]
    pub pattern_name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub state: Option<ProcessState>,
}

impl ListFilter {
    fn matches(&self, record: &ProcessRecord) -> bool {
        self.pattern_name
            .as_ref()
            .map_or(true, |p| &record.pattern_name == p)
            && self
                .namespace
                .as_ref()
                .map_or(true, |ns| record.scope.namespace() == Some(ns.as_str()))
            && self.state.map_or(true, |s| record.state == s)
    }
}

/// Aggregate launcher health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherHealth {
    pub total: usize,
    pub running: usize,
    pub terminating: usize,
    pub failed: usize,
    pub uptime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processes: Option<Vec<ProcessRecord>>,
}

struct ProcessEntry {
    record: ProcessRecord,
    pattern_config: PatternConfig,
    child: Option<Arc<dyn ChildHandle>>,
    client: Option<RpcClient>,
    health_failures: u32,
    crash_times: VecDeque<DateTime<Utc>>,
}

impl ProcessEntry {
    fn new(record: ProcessRecord, pattern_config: PatternConfig) -> Self {
        Self {
            record,
            pattern_config,
            child: None,
            client: None,
            health_failures: 0,
            crash_times: VecDeque::new(),
        }
    }
}

/// The pattern launcher and supervisor
pub struct Launcher {
    config: LauncherConfig,
    spawner: Arc<dyn ProcessSpawner>,
    inventory: tokio::sync::RwLock<HashMap<String, ProcessEntry>>,
    /// Per-process-id transition lanes
    lanes: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    started_at: tokio::time::Instant,
    shutdown: CancellationToken,
}

impl Launcher {
    pub fn new(config: LauncherConfig, spawner: Arc<dyn ProcessSpawner>) -> Arc<Self> {
        Arc::new(Self {
            config,
            spawner,
            inventory: tokio::sync::RwLock::new(HashMap::new()),
            lanes: DashMap::new(),
            started_at: tokio::time::Instant::now(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn lane(&self, process_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.lanes.entry(process_id.to_string()).or_default().clone()
    }

    /// Start background duties: health polling and (when persistence is
    /// configured) adoption of children recorded by a previous run.
    pub async fn start(self: &Arc<Self>) {
        if let Some(path) = self.config.persistence_path.clone() {
            if let Err(e) = self.adopt_persisted(&path).await {
                warn!("inventory adoption failed: {e}");
            }
        }
        let launcher = self.clone();
        tokio::spawn(async move { launcher.health_poll_loop().await });
    }

    // ---- launch ----------------------------------------------------------

    pub async fn launch(self: &Arc<Self>, request: LaunchRequest) -> Result<ProcessRecord> {
        let process_id = request.scope.process_id(&request.pattern_name);
        let lane = self.lane(&process_id);
        let _guard = lane.lock().await;

        {
            let inventory = self.inventory.read().await;
            if let Some(entry) = inventory.get(&process_id) {
                if entry.record.state.is_active() {
                    return Err(PrismError::conflict(format!(
                        "process {process_id} is already {}",
                        entry.record.state
                    )));
                }
                if entry.record.in_backoff() {
                    let retry_after = entry
                        .record
                        .backoff_deadline
                        .and_then(|d| (d - Utc::now()).to_std().ok());
                    return Err(PrismError::exhausted(
                        format!("process {process_id} is backing off after a crash"),
                        retry_after,
                    ));
                }
            }
        }

        let record = ProcessRecord::new(&request.pattern_name, request.scope.clone());
        {
            let mut inventory = self.inventory.write().await;
            let previous = inventory.insert(
                process_id.clone(),
                ProcessEntry::new(record, request.config.clone()),
            );
            if let Some(previous) = previous {
                // Carry the crash history across relaunches of the same id.
                if let Some(entry) = inventory.get_mut(&process_id) {
                    entry.crash_times = previous.crash_times;
                }
            }
        }

        match self.spawn_and_start(&process_id).await {
            Ok(()) => {}
            Err(e) => {
                self.handle_failure_locked(&process_id).await;
                return Err(e);
            }
        }
        self.record(&process_id)
            .await
            .ok_or_else(|| PrismError::fatal("launched process vanished from inventory"))
    }

    /// Spawn the child, wait for its dial-back, then Initialize + Start.
    /// The caller holds the lane.
    async fn spawn_and_start(self: &Arc<Self>, process_id: &str) -> Result<()> {
        let (pattern_name, pattern_config) = {
            let mut inventory = self.inventory.write().await;
            let entry = inventory
                .get_mut(process_id)
                .ok_or_else(|| PrismError::not_found(format!("process {process_id}")))?;
            entry.record.state = ProcessState::Starting;
            entry.record.healthy = false;
            (entry.record.pattern_name.clone(), entry.pattern_config.clone())
        };

        let spawn_request = SpawnRequest {
            process_id: process_id.to_string(),
            pattern_name: pattern_name.clone(),
            startup_wait: self.config.startup_wait(),
        };
        let child = self.spawner.spawn(&spawn_request).await?;
        let control_address = child.control_address().to_string();

        let startup_wait = self.config.startup_wait();
        let dial_and_start = async {
            let client = RpcClient::connect_timeout(&control_address, startup_wait)
                .await
                .map_err(|e| {
                    PrismError::fatal(format!("dialing child control plane {control_address}: {e}"))
                })?;
            let init: InitializeReply = client
                .call(
                    lifecycle_methods::INITIALIZE,
                    &InitializeParams {
                        name: pattern_name.clone(),
                        version: String::new(),
                        config: pattern_config,
                    },
                    startup_wait,
                )
                .await?;
            if !init.success {
                return Err(PrismError::fatal("child rejected initialization"));
            }
            let started: StartReply = client
                .call(lifecycle_methods::START, &serde_json::json!({}), startup_wait)
                .await?;
            Ok((client, started))
        };
        let (client, started) = match dial_and_start.await {
            Ok(ok) => ok,
            Err(e) => {
                // Do not leave an unsupervised child behind.
                child.kill().await;
                return Err(e);
            }
        };

        {
            let mut inventory = self.inventory.write().await;
            let entry = inventory
                .get_mut(process_id)
                .ok_or_else(|| PrismError::not_found(format!("process {process_id}")))?;
            entry.record.pid = Some(child.pid());
            entry.record.control_plane_address = Some(control_address);
            entry.record.data_plane_address = Some(started.data_endpoint);
            entry.record.state = ProcessState::Running;
            entry.record.healthy = true;
            entry.record.started_at = Some(Utc::now());
            entry.record.backoff_deadline = None;
            entry.health_failures = 0;
            entry.child = Some(child.clone());
            entry.client = Some(client);
        }
        info!(process_id, pattern = %pattern_name, pid = child.pid(), "pattern running");

        let launcher = self.clone();
        let id = process_id.to_string();
        let pid = child.pid();
        tokio::spawn(async move { launcher.watch_exit(id, pid, child).await });
        Ok(())
    }

    /// Waits for the child to exit and reconciles the record
    async fn watch_exit(self: Arc<Self>, process_id: String, pid: u32, child: Arc<dyn ChildHandle>) {
        let outcome = child.wait().await;
        let lane = self.lane(&process_id);
        let _guard = lane.lock().await;

        let decision = {
            let mut inventory = self.inventory.write().await;
            let Some(entry) = inventory.get_mut(&process_id) else {
                return;
            };
            // A respawn may already own this id.
            if entry.record.pid != Some(pid) {
                return;
            }
            entry.child = None;
            entry.client = None;
            match (entry.record.state, outcome) {
                // We initiated the stop, or the child left cleanly.
                (ProcessState::Terminating | ProcessState::Draining, _)
                | (_, ExitOutcome::Clean) => {
                    entry.record.state = ProcessState::Exited;
                    entry.record.healthy = false;
                    None
                }
                (_, ExitOutcome::Failed(code)) => Some(code),
            }
        };

        if let Some(code) = decision {
            warn!(process_id = %process_id, pid, exit_code = ?code, "pattern process died");
            self.handle_failure_locked(&process_id).await;
        } else {
            info!(process_id = %process_id, pid, "pattern process exited");
        }
    }

    /// Apply the restart policy to a failed process. Caller holds the lane.
    fn handle_failure_locked<'a>(
        self: &'a Arc<Self>,
        process_id: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(self.handle_failure_locked_impl(process_id))
    }

    async fn handle_failure_locked_impl(self: &Arc<Self>, process_id: &str) {
        let restart_at = {
            let mut inventory = self.inventory.write().await;
            let Some(entry) = inventory.get_mut(process_id) else {
                return;
            };
            entry.record.state = ProcessState::Failed;
            entry.record.healthy = false;
            entry.child = None;
            entry.client = None;

            let now = Utc::now();
            entry.crash_times.push_back(now);
            let window = chrono::Duration::from_std(self.config.restart.budget_window())
                .unwrap_or(chrono::Duration::seconds(300));
            while let Some(first) = entry.crash_times.front() {
                if now - *first > window {
                    entry.crash_times.pop_front();
                } else {
                    break;
                }
            }

            if !self.config.restart.restarts_on_failure() {
                entry.record.backoff_deadline = None;
                return;
            }
            if entry.crash_times.len() as u32 > self.config.restart.restart_budget {
                error!(
                    process_id,
                    crashes = entry.crash_times.len(),
                    "restart budget exhausted, giving up"
                );
                entry.record.backoff_deadline = None;
                return;
            }

            let backoff = self.config.restart.backoff_for(entry.record.restart_count);
            let deadline = now
                + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::seconds(30));
            entry.record.backoff_deadline = Some(deadline);
            info!(process_id, backoff_ms = backoff.as_millis() as u64, "restart scheduled");
            Some((backoff, deadline))
        };

        let Some((backoff, deadline)) = restart_at else {
            return;
        };
        let launcher = self.clone();
        let id = process_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = launcher.shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            let lane = launcher.lane(&id);
            let _guard = lane.lock().await;
            {
                let mut inventory = launcher.inventory.write().await;
                let Some(entry) = inventory.get_mut(&id) else { return };
                // Another transition superseded this restart.
                if entry.record.state != ProcessState::Failed
                    || entry.record.backoff_deadline != Some(deadline)
                {
                    return;
                }
                entry.record.restart_count += 1;
                entry.record.backoff_deadline = None;
            }
            match launcher.spawn_and_start(&id).await {
                Ok(()) => info!(process_id = %id, "pattern restarted"),
                Err(e) => {
                    warn!(process_id = %id, "restart attempt failed: {e}");
                    launcher.handle_failure_locked(&id).await;
                }
            }
        });
    }

    // ---- terminate -------------------------------------------------------

    /// Drain, stop, signal, escalate. Idempotent once the process is gone.
    pub async fn terminate(
        self: &Arc<Self>,
        process_id: &str,
        grace_period: Duration,
    ) -> Result<()> {
        let lane = self.lane(process_id);
        let _guard = lane.lock().await;

        let (child, client) = {
            let mut inventory = self.inventory.write().await;
            let entry = inventory
                .get_mut(process_id)
                .ok_or_else(|| PrismError::not_found(format!("process {process_id}")))?;
            if !entry.record.state.is_active() {
                return Ok(());
            }
            entry.record.state = ProcessState::Draining;
            (entry.child.clone(), entry.client.clone())
        };

        if let Some(client) = &client {
            let drain: Result<serde_json::Value> = client
                .call(
                    lifecycle_methods::DRAIN,
                    &DrainParams {
                        timeout_secs: grace_period.as_secs(),
                        reason: "terminate".to_string(),
                    },
                    grace_period + Duration::from_secs(1),
                )
                .await;
            if let Err(e) = drain {
                warn!(process_id, "drain failed: {e}");
            }
            let stop: Result<serde_json::Value> = client
                .call(
                    lifecycle_methods::STOP,
                    &serde_json::json!({}),
                    Duration::from_secs(5),
                )
                .await;
            if let Err(e) = stop {
                warn!(process_id, "stop failed: {e}");
            }
        }

        {
            let mut inventory = self.inventory.write().await;
            if let Some(entry) = inventory.get_mut(process_id) {
                entry.record.state = ProcessState::Terminating;
            }
        }

        if let Some(child) = child {
            child.terminate().await;
            let exited = tokio::time::timeout(grace_period, child.wait()).await;
            if exited.is_err() {
                warn!(process_id, "grace period elapsed, killing");
                child.kill().await;
                let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
            }
        }

        {
            let mut inventory = self.inventory.write().await;
            if let Some(entry) = inventory.get_mut(process_id) {
                entry.record.state = ProcessState::Exited;
                entry.record.healthy = false;
                entry.child = None;
                entry.client = None;
            }
        }
        info!(process_id, "pattern terminated");
        Ok(())
    }

    // ---- health polling --------------------------------------------------

    async fn health_poll_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.config.resync_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tick.tick() => {}
            }
            let targets: Vec<(String, RpcClient)> = {
                let inventory = self.inventory.read().await;
                inventory
                    .iter()
                    .filter(|(_, e)| e.record.state == ProcessState::Running)
                    .filter_map(|(id, e)| e.client.clone().map(|c| (id.clone(), c)))
                    .collect()
            };
            for (process_id, client) in targets {
                let healthy = match client
                    .call_value(
                        lifecycle_methods::HEALTH_CHECK,
                        serde_json::Value::Null,
                        HEALTH_CALL_TIMEOUT,
                    )
                    .await
                {
                    Ok(report) => report["status"] != "Unhealthy",
                    Err(_) => false,
                };
                self.note_health(&process_id, healthy).await;
            }
        }
    }

    async fn note_health(self: &Arc<Self>, process_id: &str, check_passed: bool) {
        let needs_restart = {
            let mut inventory = self.inventory.write().await;
            let Some(entry) = inventory.get_mut(process_id) else {
                return;
            };
            if entry.record.state != ProcessState::Running {
                return;
            }
            entry.record.last_health_at = Some(Utc::now());
            if check_passed {
                entry.health_failures = 0;
                entry.record.healthy = true;
                false
            } else {
                entry.health_failures += 1;
                // Two consecutive misses flip the flag, more trigger restart.
                if entry.health_failures >= 2 {
                    entry.record.healthy = false;
                }
                entry.health_failures >= self.config.max_health_failures
            }
        };

        if needs_restart {
            warn!(process_id, "liveness lost, restarting");
            let lane = self.lane(process_id);
            let _guard = lane.lock().await;
            let child = {
                let inventory = self.inventory.read().await;
                inventory.get(process_id).and_then(|e| e.child.clone())
            };
            if let Some(child) = child {
                child.kill().await;
                // watch_exit picks the failure up and applies the policy.
            } else {
                self.handle_failure_locked(process_id).await;
            }
        }
    }

    // ---- queries ---------------------------------------------------------

    pub async fn record(&self, process_id: &str) -> Option<ProcessRecord> {
        self.inventory
            .read()
            .await
            .get(process_id)
            .map(|e| e.record.clone())
    }

    pub async fn list(&self, filter: &ListFilter) -> Vec<ProcessRecord> {
        let inventory = self.inventory.read().await;
        let mut records: Vec<ProcessRecord> = inventory
            .values()
            .map(|e| e.record.clone())
            .filter(|r| filter.matches(r))
            .collect();
        records.sort_by(|a, b| a.process_id.cmp(&b.process_id));
        records
    }

    pub async fn health(&self, include_processes: bool) -> LauncherHealth {
        let inventory = self.inventory.read().await;
        let mut health = LauncherHealth {
            total: inventory.len(),
            running: 0,
            terminating: 0,
            failed: 0,
            uptime_secs: self.started_at.elapsed().as_secs(),
            processes: None,
        };
        for entry in inventory.values() {
            match entry.record.state {
                ProcessState::Running => health.running += 1,
                ProcessState::Draining | ProcessState::Terminating => health.terminating += 1,
                ProcessState::Failed => health.failed += 1,
                _ => {}
            }
        }
        if include_processes {
            let mut records: Vec<ProcessRecord> =
                inventory.values().map(|e| e.record.clone()).collect();
            records.sort_by(|a, b| a.process_id.cmp(&b.process_id));
            health.processes = Some(records);
        }
        health
    }

    // ---- shutdown and adoption ------------------------------------------

    /// Drain every process in parallel, then persist the inventory
    pub async fn shutdown(self: &Arc<Self>) {
        info!("launcher shutting down");
        self.shutdown.cancel();

        let ids: Vec<String> = {
            let inventory = self.inventory.read().await;
            inventory
                .iter()
                .filter(|(_, e)| e.record.state.is_active())
                .map(|(id, _)| id.clone())
                .collect()
        };
        let grace = self.config.default_grace_period();
        join_all(ids.iter().map(|id| {
            let launcher = self.clone();
            let id = id.clone();
            async move {
                if let Err(e) = launcher.terminate(&id, grace).await {
                    warn!(process_id = %id, "shutdown terminate failed: {e}");
                }
            }
        }))
        .await;

        if let Some(path) = &self.config.persistence_path {
            let snapshot: Vec<PersistedProcess> = {
                let inventory = self.inventory.read().await;
                inventory
                    .values()
                    .map(|e| PersistedProcess {
                        record: e.record.clone(),
                        pattern_config: e.pattern_config.clone(),
                    })
                    .collect()
            };
            if let Err(e) = persistence::save(path, &snapshot) {
                warn!("persisting inventory failed: {e}");
            }
        }
    }

    /// Re-dial children recorded by a previous launcher run; adopt the ones
    /// that answer, respawn the ones that do not.
    async fn adopt_persisted(self: &Arc<Self>, path: &std::path::Path) -> Result<()> {
        let snapshot = persistence::load(path)?;
        for persisted in snapshot {
            let process_id = persisted.record.process_id.clone();
            if !persisted.record.state.is_active() {
                continue;
            }
            let lane = self.lane(&process_id);
            let _guard = lane.lock().await;

            let mut entry = ProcessEntry::new(persisted.record.clone(), persisted.pattern_config);
            let adopted = match &persisted.record.control_plane_address {
                Some(address) => {
                    match RpcClient::connect_timeout(address, Duration::from_secs(2)).await {
                        Ok(client) => {
                            let alive: Result<serde_json::Value> = client
                                .call_value(
                                    lifecycle_methods::HEALTH_CHECK,
                                    serde_json::Value::Null,
                                    HEALTH_CALL_TIMEOUT,
                                )
                                .await;
                            if alive.is_ok() {
                                entry.client = Some(client);
                                true
                            } else {
                                false
                            }
                        }
                        Err(_) => false,
                    }
                }
                None => false,
            };

            if adopted {
                info!(process_id = %process_id, "adopted still-running child");
                entry.record.state = ProcessState::Running;
                entry.record.healthy = true;
                self.inventory.write().await.insert(process_id, entry);
            } else {
                info!(process_id = %process_id, "persisted child unreachable, respawning");
                entry.record.state = ProcessState::Pending;
                entry.record.pid = None;
                entry.record.control_plane_address = None;
                entry.record.data_plane_address = None;
                self.inventory.write().await.insert(process_id.clone(), entry);
                if let Err(e) = self.spawn_and_start(&process_id).await {
                    warn!(process_id = %process_id, "respawn of persisted child failed: {e}");
                    self.handle_failure_locked(&process_id).await;
                }
            }
        }
        Ok(())
    }
}
