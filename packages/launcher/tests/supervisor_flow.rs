//! Supervisor behavior against an in-process fake spawner whose children
//! are real pattern runtimes served over real lifecycle sockets.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use prism_capabilities::{PrismError, Result};
use prism_drivers::DriverSpec;
use prism_launcher::persistence::{save, PersistedProcess};
use prism_launcher::{
    AnnounceHub, ChildHandle, ExitOutcome, IsolationScope, LaunchRequest, Launcher,
    LauncherConfig, ProcessSpawner, ProcessState, SpawnRequest,
};
use prism_patterns::{KeyValuePattern, LifecycleService, PatternConfig, PatternRuntime};
use prism_rpc::{RpcClient, RpcServer};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

fn keyvalue_config() -> PatternConfig {
    let mut config = PatternConfig::new("keyvalue");
    config.keyvalue = Some(DriverSpec::new("memory"));
    config
}

struct FakeChild {
    pid: u32,
    control_address: String,
    server_shutdown: CancellationToken,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
}

impl FakeChild {
    fn crash(&self) {
        self.server_shutdown.cancel();
        let _ = self.exit_tx.send(Some(ExitOutcome::Failed(Some(9))));
    }
}

#[async_trait]
impl ChildHandle for FakeChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn control_address(&self) -> &str {
        &self.control_address
    }

    async fn wait(&self) -> ExitOutcome {
        let mut exit = self.exit_rx.clone();
        loop {
            if let Some(outcome) = *exit.borrow() {
                return outcome;
            }
            if exit.changed().await.is_err() {
                return ExitOutcome::Failed(None);
            }
        }
    }

    async fn terminate(&self) {
        self.server_shutdown.cancel();
        let _ = self.exit_tx.send(Some(ExitOutcome::Clean));
    }

    async fn kill(&self) {
        self.server_shutdown.cancel();
        let _ = self.exit_tx.send(Some(ExitOutcome::Failed(Some(9))));
    }
}

/// Spawns real pattern runtimes in-process instead of executables
struct FakeSpawner {
    next_pid: AtomicU32,
    fail_next: AtomicU32,
    children: Mutex<Vec<Arc<FakeChild>>>,
}

impl FakeSpawner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(100),
            fail_next: AtomicU32::new(0),
            children: Mutex::new(Vec::new()),
        })
    }

    fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    fn latest_child(&self) -> Arc<FakeChild> {
        self.children.lock().last().cloned().expect("a spawned child")
    }

    fn spawn_count(&self) -> usize {
        self.children.lock().len()
    }
}

#[async_trait]
impl ProcessSpawner for FakeSpawner {
    async fn spawn(&self, request: &SpawnRequest) -> Result<Arc<dyn ChildHandle>> {
        if request.pattern_name != "keyvalue" {
            return Err(PrismError::not_found(format!(
                "no executable for pattern {}",
                request.pattern_name
            )));
        }
        let failures = self.fail_next.load(Ordering::SeqCst);
        if failures > 0 {
            self.fail_next.store(failures - 1, Ordering::SeqCst);
            return Err(PrismError::fatal("induced spawn failure"));
        }

        let runtime = Arc::new(PatternRuntime::new(Arc::new(KeyValuePattern)));
        let server = RpcServer::bind("127.0.0.1:0", Arc::new(LifecycleService::new(runtime)))
            .await?;
        let (addr, server_shutdown) = server.spawn()?;

        let (exit_tx, exit_rx) = watch::channel(None);
        let child = Arc::new(FakeChild {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            control_address: addr.to_string(),
            server_shutdown,
            exit_tx,
            exit_rx,
        });
        self.children.lock().push(child.clone());
        Ok(child)
    }
}

fn test_config() -> LauncherConfig {
    let mut config = LauncherConfig::new("/nonexistent");
    config.startup_wait_secs = 5;
    config.resync_interval_secs = 1;
    config.restart.initial_backoff_ms = 50;
    config.restart.max_backoff_secs = 1;
    config.restart.restart_budget = 3;
    config
}

fn launch_request(namespace: &str) -> LaunchRequest {
    LaunchRequest {
        pattern_name: "keyvalue".to_string(),
        scope: IsolationScope::Namespace {
            namespace: namespace.to_string(),
        },
        config: keyvalue_config(),
    }
}

async fn wait_for<F>(launcher: &Arc<Launcher>, process_id: &str, mut predicate: F)
where
    F: FnMut(&prism_launcher::ProcessRecord) -> bool,
{
    for _ in 0..300 {
        if let Some(record) = launcher.record(process_id).await {
            if predicate(&record) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached for {process_id} within 3s");
}

#[tokio::test]
async fn launch_runs_the_pattern_and_serves_data() {
    let spawner = FakeSpawner::new();
    let launcher = Launcher::new(test_config(), spawner);
    launcher.start().await;

    let record = launcher.launch(launch_request("A")).await.unwrap();
    assert_eq!(record.process_id, "ns:A:keyvalue");
    assert_eq!(record.state, ProcessState::Running);
    assert!(record.healthy);

    // The child's data plane answers through the advertised endpoint.
    let data_addr = record.data_plane_address.unwrap();
    let client = RpcClient::connect(&data_addr).await.unwrap();
    client
        .call_value(
            "KeyValueBasic.Set",
            serde_json::json!({"key": "k", "value": [7]}),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    let got = client
        .call_value(
            "KeyValueBasic.Get",
            serde_json::json!({"key": "k"}),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(got["found"], true);
}

#[tokio::test]
async fn duplicate_launch_is_a_conflict() {
    let spawner = FakeSpawner::new();
    let launcher = Launcher::new(test_config(), spawner);
    launcher.start().await;

    launcher.launch(launch_request("A")).await.unwrap();
    let err = launcher.launch(launch_request("A")).await.unwrap_err();
    assert!(err.is_conflict());

    // A different namespace is a different process id.
    launcher.launch(launch_request("B")).await.unwrap();
}

#[tokio::test]
async fn unknown_pattern_is_not_found() {
    let spawner = FakeSpawner::new();
    let launcher = Launcher::new(test_config(), spawner);
    launcher.start().await;

    let err = launcher
        .launch(LaunchRequest {
            pattern_name: "no-such-pattern".to_string(),
            scope: IsolationScope::None,
            config: keyvalue_config(),
        })
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn crashed_child_is_restarted_with_an_incremented_count() {
    let spawner = FakeSpawner::new();
    let launcher = Launcher::new(test_config(), spawner.clone());
    launcher.start().await;

    launcher.launch(launch_request("A")).await.unwrap();
    let first_pid = launcher
        .record("ns:A:keyvalue")
        .await
        .unwrap()
        .pid
        .unwrap();

    spawner.latest_child().crash();

    wait_for(&launcher, "ns:A:keyvalue", |r| {
        r.state == ProcessState::Running && r.restart_count == 1
    })
    .await;
    let record = launcher.record("ns:A:keyvalue").await.unwrap();
    assert_ne!(record.pid.unwrap(), first_pid);
    assert_eq!(spawner.spawn_count(), 2);
}

#[tokio::test]
async fn terminate_drains_and_exits_without_restart() {
    let spawner = FakeSpawner::new();
    let launcher = Launcher::new(test_config(), spawner.clone());
    launcher.start().await;

    launcher.launch(launch_request("A")).await.unwrap();
    launcher
        .terminate("ns:A:keyvalue", Duration::from_secs(2))
        .await
        .unwrap();

    let record = launcher.record("ns:A:keyvalue").await.unwrap();
    assert_eq!(record.state, ProcessState::Exited);

    // No restart follows a terminate.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(spawner.spawn_count(), 1);

    let err = launcher
        .terminate("ghost", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn repeated_spawn_failures_exhaust_the_restart_budget() {
    let spawner = FakeSpawner::new();
    let launcher = Launcher::new(test_config(), spawner.clone());
    launcher.start().await;

    spawner.fail_next(100);
    let err = launcher.launch(launch_request("A")).await.unwrap_err();
    assert!(err.is_fatal());

    // Backoff retries burn through the budget, then the record settles in
    // Failed with no further attempts.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let record = launcher.record("ns:A:keyvalue").await.unwrap();
    assert_eq!(record.state, ProcessState::Failed);
    assert!(!record.in_backoff());
    assert_eq!(spawner.spawn_count(), 0);
}

#[tokio::test]
async fn health_aggregates_process_states() {
    let spawner = FakeSpawner::new();
    let launcher = Launcher::new(test_config(), spawner);
    launcher.start().await;

    launcher.launch(launch_request("A")).await.unwrap();
    launcher.launch(launch_request("B")).await.unwrap();
    launcher
        .terminate("ns:B:keyvalue", Duration::from_secs(1))
        .await
        .unwrap();

    let health = launcher.health(true).await;
    assert_eq!(health.total, 2);
    assert_eq!(health.running, 1);
    let processes = health.processes.unwrap();
    assert_eq!(processes.len(), 2);
}

#[tokio::test]
async fn adoption_dials_persisted_children_before_respawning() {
    // A live child from a "previous launcher": a real runtime + lifecycle
    // server we persist the address of.
    let runtime = Arc::new(PatternRuntime::new(Arc::new(KeyValuePattern)));
    runtime
        .initialize("keyvalue", keyvalue_config())
        .await
        .unwrap();
    runtime.start().await.unwrap();
    let server = RpcServer::bind(
        "127.0.0.1:0",
        Arc::new(LifecycleService::new(runtime)),
    )
    .await
    .unwrap();
    let (addr, _server_shutdown) = server.spawn().unwrap();

    let dir = tempfile::TempDir::new().unwrap();
    let state_path = dir.path().join("inventory.jsonl");
    let mut record = prism_launcher::ProcessRecord::new(
        "keyvalue",
        IsolationScope::Namespace {
            namespace: "A".into(),
        },
    );
    record.state = ProcessState::Running;
    record.pid = Some(4242);
    record.control_plane_address = Some(addr.to_string());
    save(
        &state_path,
        &[PersistedProcess {
            record,
            pattern_config: keyvalue_config(),
        }],
    )
    .unwrap();

    let mut config = test_config();
    config.persistence_path = Some(state_path);
    let spawner = FakeSpawner::new();
    let launcher = Launcher::new(config, spawner.clone());
    launcher.start().await;

    wait_for(&launcher, "ns:A:keyvalue", |r| {
        r.state == ProcessState::Running
    })
    .await;
    // Adopted, not respawned.
    assert_eq!(spawner.spawn_count(), 0);
}

#[tokio::test]
async fn launch_during_backoff_reports_retry_hint() {
    let spawner = FakeSpawner::new();
    let mut config = test_config();
    config.restart.initial_backoff_ms = 60_000;
    let launcher = Launcher::new(config, spawner.clone());
    launcher.start().await;

    spawner.fail_next(1);
    let _ = launcher.launch(launch_request("A")).await.unwrap_err();

    // The failed launch scheduled a far-future restart; a second launch
    // while backing off is refused with a hint.
    let err = launcher.launch(launch_request("A")).await.unwrap_err();
    assert_eq!(
        err.kind(),
        prism_capabilities::ErrorKind::CapacityExhausted
    );
    assert!(err.retry_after().is_some());
}
