//! Spawning pattern processes and hearing them dial back.
//!
//! The launcher hands a child two pieces of environment: the callback
//! address of the [`AnnounceHub`] and its assigned process id. The child
//! binds its lifecycle port, connects to the callback, and writes one JSON
//! announce line; the spawner resolves once that announce arrives or the
//! startup wait elapses.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use prism_capabilities::{PrismError, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Environment variable carrying the callback address to children
pub const CALLBACK_ADDR_ENV: &str = "PRISM_CALLBACK_ADDR";
/// Environment variable carrying the assigned process id to children
pub const PROCESS_ID_ENV: &str = "PRISM_PROCESS_ID";

/// The one line a child writes to the callback socket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announce {
    pub process_id: String,
    pub pid: u32,
    pub control_address: String,
}

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Zero exit code: no restart
    Clean,
    /// Non-zero or signalled
    Failed(Option<i32>),
}

/// What the launcher asks the spawner for
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub process_id: String,
    pub pattern_name: String,
    pub startup_wait: Duration,
}

/// A running child as the supervisor sees it
#[async_trait]
pub trait ChildHandle: Send + Sync {
    fn pid(&self) -> u32;
    fn control_address(&self) -> &str;
    /// Resolves when the process exits
    async fn wait(&self) -> ExitOutcome;
    /// Graceful signal (SIGTERM)
    async fn terminate(&self);
    /// Forceful kill (SIGKILL)
    async fn kill(&self);
}

/// Turns spawn requests into running, announced children
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(&self, request: &SpawnRequest) -> Result<Arc<dyn ChildHandle>>;
}

/// Listens for child announces and routes them to waiting spawns
pub struct AnnounceHub {
    address: String,
    pending: DashMap<String, oneshot::Sender<Announce>>,
}

impl AnnounceHub {
    pub async fn bind() -> Result<Arc<Self>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();
        let hub = Arc::new(Self {
            address,
            pending: DashMap::new(),
        });

        let accept_hub = hub.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let hub = accept_hub.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stream).lines();
                    match lines.next_line().await {
                        Ok(Some(line)) => match serde_json::from_str::<Announce>(&line) {
                            Ok(announce) => {
                                debug!(
                                    process_id = %announce.process_id,
                                    control = %announce.control_address,
                                    "child announced"
                                );
                                match hub.pending.remove(&announce.process_id) {
                                    Some((_, tx)) => {
                                        let _ = tx.send(announce);
                                    }
                                    None => warn!(
                                        process_id = %announce.process_id,
                                        "announce for unknown process"
                                    ),
                                }
                            }
                            Err(e) => warn!("malformed announce: {e}"),
                        },
                        _ => debug!("announce connection closed without a line"),
                    }
                });
            }
        });
        Ok(hub)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Wait for the announce of `process_id` for up to `timeout`
    pub async fn expect(&self, process_id: &str, timeout: Duration) -> Result<Announce> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(process_id.to_string(), tx);
        let announce = tokio::time::timeout(timeout, rx).await;
        self.pending.remove(process_id);
        match announce {
            Ok(Ok(announce)) => Ok(announce),
            Ok(Err(_)) => Err(PrismError::fatal("announce channel dropped")),
            Err(_) => Err(PrismError::fatal(format!(
                "child {process_id} did not dial back within {timeout:?}"
            ))),
        }
    }
}

enum ChildCommand {
    Terminate,
    Kill,
}

/// Child spawned from a pattern executable
struct ExecutableChild {
    pid: u32,
    control_address: String,
    commands: mpsc::UnboundedSender<ChildCommand>,
    exit: watch::Receiver<Option<ExitOutcome>>,
}

#[async_trait]
impl ChildHandle for ExecutableChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn control_address(&self) -> &str {
        &self.control_address
    }

    async fn wait(&self) -> ExitOutcome {
        let mut exit = self.exit.clone();
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
        let _ = self.commands.send(ChildCommand::Terminate);
    }

    async fn kill(&self) {
        let _ = self.commands.send(ChildCommand::Kill);
    }
}

/// Spawner backed by a directory of pattern executables: the executable for
/// pattern `p` is `{patterns_dir}/p`.
pub struct ExecutableSpawner {
    patterns_dir: PathBuf,
    hub: Arc<AnnounceHub>,
}

impl ExecutableSpawner {
    pub fn new(patterns_dir: impl Into<PathBuf>, hub: Arc<AnnounceHub>) -> Self {
        Self {
            patterns_dir: patterns_dir.into(),
            hub,
        }
    }
}

#[async_trait]
impl ProcessSpawner for ExecutableSpawner {
    async fn spawn(&self, request: &SpawnRequest) -> Result<Arc<dyn ChildHandle>> {
        let executable = self.patterns_dir.join(&request.pattern_name);
        if !executable.is_file() {
            return Err(PrismError::not_found(format!(
                "no executable for pattern {} in {}",
                request.pattern_name,
                self.patterns_dir.display()
            )));
        }

        let mut child = tokio::process::Command::new(&executable)
            .arg("--pattern")
            .arg(&request.pattern_name)
            .env(CALLBACK_ADDR_ENV, self.hub.address())
            .env(PROCESS_ID_ENV, &request.process_id)
            .spawn()
            .map_err(|e| PrismError::fatal(format!("spawn {}: {e}", executable.display())))?;
        let pid = child
            .id()
            .ok_or_else(|| PrismError::fatal("spawned child has no pid"))?;
        info!(process_id = %request.process_id, pid, "pattern process spawned");

        // One watcher task owns the Child: it forwards signals and reports
        // the exit status exactly once.
        let (commands, mut command_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    command = command_rx.recv() => match command {
                        Some(ChildCommand::Terminate) => {
                            #[cfg(unix)]
                            unsafe {
                                libc::kill(pid as i32, libc::SIGTERM);
                            }
                            #[cfg(not(unix))]
                            let _ = child.start_kill();
                        }
                        Some(ChildCommand::Kill) => {
                            let _ = child.start_kill();
                        }
                        // All handles dropped: only the exit remains.
                        None => {
                            let outcome = match child.wait().await {
                                Ok(status) if status.success() => ExitOutcome::Clean,
                                Ok(status) => ExitOutcome::Failed(status.code()),
                                Err(_) => ExitOutcome::Failed(None),
                            };
                            let _ = exit_tx.send(Some(outcome));
                            return;
                        }
                    },
                    status = child.wait() => {
                        let outcome = match status {
                            Ok(status) if status.success() => ExitOutcome::Clean,
                            Ok(status) => ExitOutcome::Failed(status.code()),
                            Err(_) => ExitOutcome::Failed(None),
                        };
                        let _ = exit_tx.send(Some(outcome));
                        return;
                    }
                }
            }
        });

        let announce = match self.hub.expect(&request.process_id, request.startup_wait).await {
            Ok(announce) => announce,
            Err(e) => {
                // Reap the silent child before reporting the failure.
                let _ = commands.send(ChildCommand::Kill);
                return Err(e);
            }
        };

        Ok(Arc::new(ExecutableChild {
            pid,
            control_address: announce.control_address,
            commands,
            exit: exit_rx,
        }))
    }
}
