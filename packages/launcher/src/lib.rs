//! # Prism Launcher
//!
//! The long-lived supervisor of pattern processes: it resolves pattern
//! names to executables, spawns children under namespace/session isolation
//! scopes, walks them through `Initialize`/`Start` over the lifecycle
//! plane, polls their health, restarts crashes under an exponential-backoff
//! budget, and exposes the `PatternLauncher` control plane to operators.

pub mod cluster;
pub mod config;
pub mod persistence;
pub mod process;
pub mod server;
pub mod spawner;
pub mod supervisor;

pub use config::{LauncherConfig, RestartConfig};
pub use process::{IsolationScope, ProcessRecord, ProcessState};
pub use server::{launcher_methods, LauncherService};
pub use spawner::{
    AnnounceHub, ChildHandle, ExecutableSpawner, ExitOutcome, ProcessSpawner, SpawnRequest,
};
pub use supervisor::{LaunchRequest, Launcher, LauncherHealth, ListFilter};
