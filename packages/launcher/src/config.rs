//! Launcher configuration: TOML file with environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use prism_capabilities::{PrismError, Result};
use serde::{Deserialize, Serialize};

/// Restart policy applied to failed pattern processes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    /// `on-failure` restarts crashed children, `never` leaves them failed
    #[serde(default = "default_policy")]
    pub policy: String,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Crashes tolerated inside the sliding window before giving up
    #[serde(default = "default_restart_budget")]
    pub restart_budget: u32,
    #[serde(default = "default_budget_window_secs")]
    pub budget_window_secs: u64,
}

fn default_policy() -> String {
    "on-failure".to_string()
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_secs() -> u64 {
    30
}

fn default_restart_budget() -> u32 {
    5
}

fn default_budget_window_secs() -> u64 {
    300
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            restart_budget: default_restart_budget(),
            budget_window_secs: default_budget_window_secs(),
        }
    }
}

impl RestartConfig {
    pub fn restarts_on_failure(&self) -> bool {
        self.policy == "on-failure"
    }

    /// Exponential backoff for the Nth restart, capped
    pub fn backoff_for(&self, restart_count: u32) -> Duration {
        let initial = Duration::from_millis(self.initial_backoff_ms);
        let max = Duration::from_secs(self.max_backoff_secs);
        initial
            .saturating_mul(2u32.saturating_pow(restart_count))
            .min(max)
    }

    pub fn budget_window(&self) -> Duration {
        Duration::from_secs(self.budget_window_secs)
    }
}

/// Admin consensus service endpoints (external collaborator)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub servers: Vec<String>,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
}

fn default_heartbeat_secs() -> u64 {
    15
}

/// Top-level launcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    #[serde(default = "default_bind")]
    pub bind_address: String,
    /// Directory holding one executable per pattern name
    pub patterns_dir: PathBuf,
    #[serde(default = "default_startup_wait_secs")]
    pub startup_wait_secs: u64,
    #[serde(default = "default_resync_secs")]
    pub resync_interval_secs: u64,
    #[serde(default = "default_grace_secs")]
    pub default_grace_period_secs: u64,
    /// Consecutive failed health checks before a restart
    #[serde(default = "default_max_health_failures")]
    pub max_health_failures: u32,
    #[serde(default)]
    pub restart: RestartConfig,
    /// Inventory snapshot location; unset disables persistence
    #[serde(default)]
    pub persistence_path: Option<PathBuf>,
    #[serde(default)]
    pub cluster: Option<ClusterConfig>,
}

fn default_bind() -> String {
    "127.0.0.1:7600".to_string()
}

fn default_startup_wait_secs() -> u64 {
    10
}

fn default_resync_secs() -> u64 {
    10
}

fn default_grace_secs() -> u64 {
    30
}

fn default_max_health_failures() -> u32 {
    3
}

impl LauncherConfig {
    pub fn new(patterns_dir: impl Into<PathBuf>) -> Self {
        Self {
            bind_address: default_bind(),
            patterns_dir: patterns_dir.into(),
            startup_wait_secs: default_startup_wait_secs(),
            resync_interval_secs: default_resync_secs(),
            default_grace_period_secs: default_grace_secs(),
            max_health_failures: default_max_health_failures(),
            restart: RestartConfig::default(),
            persistence_path: None,
            cluster: None,
        }
    }

    /// Load from a TOML file, then apply `PRISM_LAUNCHER_*` env overrides
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PrismError::validation(format!("reading {}: {e}", path.display())))?;
        let mut config: LauncherConfig = toml::from_str(&raw)
            .map_err(|e| PrismError::validation(format!("parsing {}: {e}", path.display())))?;
        config.apply_env();
        Ok(config)
    }

    /// Environment overrides win over file values
    pub fn apply_env(&mut self) {
        if let Ok(bind) = std::env::var("PRISM_LAUNCHER_BIND") {
            self.bind_address = bind;
        }
        if let Ok(dir) = std::env::var("PRISM_PATTERNS_DIR") {
            self.patterns_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("PRISM_LAUNCHER_STATE") {
            self.persistence_path = Some(PathBuf::from(path));
        }
    }

    pub fn startup_wait(&self) -> Duration {
        Duration::from_secs(self.startup_wait_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn default_grace_period(&self) -> Duration {
        Duration::from_secs(self.default_grace_period_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in() {
        let config: LauncherConfig = toml::from_str(r#"patterns_dir = "/opt/prism/patterns""#).unwrap();
        assert_eq!(config.bind_address, "127.0.0.1:7600");
        assert_eq!(config.resync_interval_secs, 10);
        assert!(config.restart.restarts_on_failure());
        assert!(config.persistence_path.is_none());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let restart = RestartConfig::default();
        assert_eq!(restart.backoff_for(0), Duration::from_millis(500));
        assert_eq!(restart.backoff_for(1), Duration::from_secs(1));
        assert_eq!(restart.backoff_for(3), Duration::from_secs(4));
        assert_eq!(restart.backoff_for(20), Duration::from_secs(30));
    }
}
