//! Prism launcher daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use prism_launcher::cluster::{
    spawn_heartbeat, AdminClusterClient, LauncherRegistration, NatsClusterClient,
};
use prism_launcher::{AnnounceHub, ExecutableSpawner, Launcher, LauncherConfig, LauncherService};
use prism_rpc::RpcServer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Prism pattern launcher
#[derive(Parser)]
#[command(name = "prismd", version, about = "Prism pattern launcher and supervisor")]
struct Args {
    /// Launcher configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory of pattern executables (overrides the config file)
    #[arg(long)]
    patterns_dir: Option<PathBuf>,

    /// Control-plane bind address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("PRISM_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => LauncherConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => {
            let mut config = LauncherConfig::new("./patterns");
            config.apply_env();
            config
        }
    };
    if let Some(dir) = args.patterns_dir {
        config.patterns_dir = dir;
    }
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }

    let hub = AnnounceHub::bind().await.context("binding announce hub")?;
    info!(callback = hub.address(), "announce hub listening");
    let spawner = Arc::new(ExecutableSpawner::new(config.patterns_dir.clone(), hub));

    let cluster_config = config.cluster.clone();
    let bind_address = config.bind_address.clone();
    let launcher = Launcher::new(config, spawner);
    launcher.start().await;

    let server = RpcServer::bind(&bind_address, Arc::new(LauncherService::new(launcher.clone())))
        .await
        .context("binding control plane")?;
    let (addr, server_shutdown) = server.spawn().context("starting control plane")?;
    info!(%addr, "control plane listening");

    if let Some(cluster_config) = cluster_config {
        match NatsClusterClient::connect(&cluster_config.servers).await {
            Ok(client) => {
                let client: Arc<dyn AdminClusterClient> = Arc::new(client);
                let launcher_id = format!("launcher-{}", Uuid::new_v4());
                if let Err(e) = client
                    .register_launcher(&LauncherRegistration {
                        launcher_id: launcher_id.clone(),
                        control_address: addr.to_string(),
                    })
                    .await
                {
                    warn!("launcher registration failed: {e}");
                }
                spawn_heartbeat(
                    client,
                    launcher_id,
                    std::time::Duration::from_secs(cluster_config.heartbeat_interval_secs),
                    launcher.shutdown_token(),
                );
            }
            Err(e) => warn!("admin cluster unavailable: {e}"),
        }
    }

    shutdown_signal().await;
    info!("shutdown signal received");
    launcher.shutdown().await;
    server_shutdown.cancel();
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
