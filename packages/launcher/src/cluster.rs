//! Client API of the leader-elected admin service.
//!
//! Launcher HA comes from an external consensus service; this module is the
//! boundary the launcher talks to. The NATS implementation issues
//! request/reply calls against the admin subjects; the in-memory fake backs
//! the test suites.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prism_capabilities::{PrismError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherRegistration {
    pub launcher_id: String,
    pub control_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRegistration {
    pub proxy_id: String,
    pub address: String,
}

/// What the launcher needs from the admin cluster
#[async_trait]
pub trait AdminClusterClient: Send + Sync {
    async fn register_launcher(&self, registration: &LauncherRegistration) -> Result<()>;
    async fn register_proxy(&self, registration: &ProxyRegistration) -> Result<()>;
    async fn create_namespace(&self, namespace: &str) -> Result<()>;
    async fn heartbeat(&self, launcher_id: &str) -> Result<()>;
}

/// Admin cluster over NATS request/reply subjects
pub struct NatsClusterClient {
    client: async_nats::Client,
}

impl NatsClusterClient {
    pub async fn connect(servers: &[String]) -> Result<Self> {
        let url = servers
            .first()
            .ok_or_else(|| PrismError::validation("cluster requires at least one server"))?;
        let client = async_nats::connect(url.clone())
            .await
            .map_err(|e| PrismError::transient(format!("cluster connect {url}: {e}")))?;
        info!(%url, "admin cluster connected");
        Ok(Self { client })
    }

    async fn request(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        let response = tokio::time::timeout(
            REQUEST_TIMEOUT,
            self.client.request(subject.to_string(), payload.into()),
        )
        .await
        .map_err(|_| PrismError::timeout(subject))?
        .map_err(|e| PrismError::transient(format!("cluster request {subject}: {e}")))?;
        debug!(subject, bytes = response.payload.len(), "cluster reply");
        Ok(())
    }
}

#[async_trait]
impl AdminClusterClient for NatsClusterClient {
    async fn register_launcher(&self, registration: &LauncherRegistration) -> Result<()> {
        self.request("prism.admin.register-launcher", serde_json::to_vec(registration)?)
            .await
    }

    async fn register_proxy(&self, registration: &ProxyRegistration) -> Result<()> {
        self.request("prism.admin.register-proxy", serde_json::to_vec(registration)?)
            .await
    }

    async fn create_namespace(&self, namespace: &str) -> Result<()> {
        self.request(
            "prism.admin.create-namespace",
            serde_json::to_vec(&serde_json::json!({ "namespace": namespace }))?,
        )
        .await
    }

    async fn heartbeat(&self, launcher_id: &str) -> Result<()> {
        self.request(
            "prism.admin.heartbeat",
            serde_json::to_vec(&serde_json::json!({ "launcher_id": launcher_id }))?,
        )
        .await
    }
}

/// In-memory fake for tests and single-node deployments
#[derive(Default)]
pub struct InMemoryClusterClient {
    launchers: parking_lot::Mutex<BTreeMap<String, LauncherRegistration>>,
    namespaces: parking_lot::Mutex<Vec<String>>,
    heartbeats: parking_lot::Mutex<BTreeMap<String, u64>>,
}

impl InMemoryClusterClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn heartbeat_count(&self, launcher_id: &str) -> u64 {
        self.heartbeats
            .lock()
            .get(launcher_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.namespaces.lock().clone()
    }
}

#[async_trait]
impl AdminClusterClient for InMemoryClusterClient {
    async fn register_launcher(&self, registration: &LauncherRegistration) -> Result<()> {
        self.launchers
            .lock()
            .insert(registration.launcher_id.clone(), registration.clone());
        Ok(())
    }

    async fn register_proxy(&self, _registration: &ProxyRegistration) -> Result<()> {
        Ok(())
    }

    async fn create_namespace(&self, namespace: &str) -> Result<()> {
        let mut namespaces = self.namespaces.lock();
        if !namespaces.iter().any(|ns| ns == namespace) {
            namespaces.push(namespace.to_string());
        }
        Ok(())
    }

    async fn heartbeat(&self, launcher_id: &str) -> Result<()> {
        *self
            .heartbeats
            .lock()
            .entry(launcher_id.to_string())
            .or_insert(0) += 1;
        Ok(())
    }
}

/// Periodic heartbeat task against the admin cluster
pub fn spawn_heartbeat(
    client: Arc<dyn AdminClusterClient>,
    launcher_id: String,
    interval: Duration,
    shutdown: tokio_util::sync::CancellationToken,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tick.tick() => {
                    if let Err(e) = client.heartbeat(&launcher_id).await {
                        tracing::warn!("cluster heartbeat failed: {e}");
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_fake_tracks_heartbeats_and_namespaces() {
        let cluster = InMemoryClusterClient::new();
        cluster
            .register_launcher(&LauncherRegistration {
                launcher_id: "l1".into(),
                control_address: "127.0.0.1:7600".into(),
            })
            .await
            .unwrap();
        cluster.create_namespace("A").await.unwrap();
        cluster.create_namespace("A").await.unwrap();
        cluster.heartbeat("l1").await.unwrap();
        cluster.heartbeat("l1").await.unwrap();

        assert_eq!(cluster.namespaces(), vec!["A".to_string()]);
        assert_eq!(cluster.heartbeat_count("l1"), 2);
    }
}
