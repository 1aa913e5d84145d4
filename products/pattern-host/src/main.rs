//! Pattern host: the executable the launcher spawns per pattern process.
//!
//! Binds the lifecycle plane on an ephemeral port, announces itself to the
//! launcher's callback socket, then waits for `Initialize`/`Start` over the
//! control plane. With `--config` it can also run standalone, initializing
//! itself from a TOML file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use prism_launcher::spawner::{Announce, CALLBACK_ADDR_ENV, PROCESS_ID_ENV};
use prism_multicast_registry::MulticastRegistryPattern;
use prism_patterns::{
    Consumer, KeyValuePattern, LifecycleService, LoggingProcessor, PatternBehavior, PatternConfig,
    PatternRuntime,
};
use prism_rpc::RpcServer;
use tokio::io::AsyncWriteExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Prism pattern host
#[derive(Parser)]
#[command(name = "prism-pattern-host", version, about = "Hosts one Prism pattern instance")]
struct Args {
    /// Pattern to host: keyvalue, consumer, or multicast-registry
    #[arg(long)]
    pattern: String,

    /// Standalone mode: initialize and start from this TOML config
    #[arg(long)]
    config: Option<PathBuf>,

    /// Lifecycle plane bind address
    #[arg(long, default_value = "127.0.0.1:0")]
    control_bind: String,
}

fn behavior_for(pattern: &str, instance: &str) -> anyhow::Result<Arc<dyn PatternBehavior>> {
    match pattern {
        "keyvalue" => Ok(Arc::new(KeyValuePattern)),
        "consumer" => Ok(Arc::new(Consumer::new(
            instance.to_string(),
            Arc::new(LoggingProcessor),
        ))),
        "multicast-registry" => Ok(Arc::new(MulticastRegistryPattern::new())),
        other => bail!("unknown pattern {other:?}, expected keyvalue, consumer, or multicast-registry"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("PRISM_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let process_id =
        std::env::var(PROCESS_ID_ENV).unwrap_or_else(|_| format!("pattern:{}", args.pattern));

    let behavior = behavior_for(&args.pattern, &process_id)?;
    let runtime = Arc::new(PatternRuntime::new(behavior));

    if let Some(path) = &args.config {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: PatternConfig =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        runtime
            .initialize(&args.pattern, config)
            .await
            .context("initializing pattern")?;
        let data_addr = runtime.start().await.context("starting pattern")?;
        info!(%data_addr, "pattern started standalone");
    }

    let server = RpcServer::bind(
        &args.control_bind,
        Arc::new(LifecycleService::new(runtime.clone())),
    )
    .await
    .context("binding lifecycle plane")?;
    let (control_addr, server_shutdown) = server.spawn().context("starting lifecycle plane")?;
    info!(%control_addr, pattern = %args.pattern, "lifecycle plane listening");

    // Dial back to the launcher that spawned us, if there is one.
    if let Ok(callback) = std::env::var(CALLBACK_ADDR_ENV) {
        let announce = Announce {
            process_id: process_id.clone(),
            pid: std::process::id(),
            control_address: control_addr.to_string(),
        };
        let mut stream = tokio::net::TcpStream::connect(&callback)
            .await
            .with_context(|| format!("dialing launcher callback {callback}"))?;
        let mut line = serde_json::to_vec(&announce)?;
        line.push(b'\n');
        stream.write_all(&line).await.context("announcing to launcher")?;
        info!(%callback, process_id = %process_id, "announced to launcher");
    }

    shutdown_signal().await;
    info!("shutdown signal received");
    let _ = runtime
        .drain(std::time::Duration::from_secs(10), "host shutdown")
        .await;
    runtime.stop().await.ok();
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
