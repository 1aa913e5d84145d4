//! Operator CLI for the Prism launcher.
//!
//! Exit codes: 0 success, 1 generic error, 2 not found, 3 invalid
//! argument, 4 conflict / already exists.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::Table;
use prism_capabilities::{ErrorKind, PrismError};
use prism_launcher::launcher_methods;
use prism_patterns::PatternConfig;
use prism_rpc::RpcClient;

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Prism launcher admin tool
#[derive(Parser)]
#[command(name = "prism-admin")]
#[command(version)]
#[command(about = "Launch, terminate, and inspect Prism pattern processes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Launcher control-plane address
    #[arg(global = true, long, default_value = "127.0.0.1:7600")]
    launcher: String,

    /// Output format
    #[arg(global = true, short, long, default_value = "table")]
    format: OutputFormat,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum OutputFormat {
    /// JSON output
    Json,
    /// Table output (default)
    Table,
    /// Plain text output
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch a pattern process
    Launch {
        /// Pattern name (must resolve to a registered executable)
        pattern: String,

        /// Isolation scope: none, namespace, or session
        #[arg(long, default_value = "none")]
        isolation: String,

        #[arg(long)]
        namespace: Option<String>,

        #[arg(long)]
        session_id: Option<String>,

        /// Pattern configuration file (TOML)
        #[arg(long)]
        config: PathBuf,
    },

    /// Drain and terminate a pattern process
    Terminate {
        process_id: String,

        /// Seconds to wait for drain before signalling
        #[arg(long, default_value = "30")]
        grace: u64,
    },

    /// Show one process record
    Status { process_id: String },

    /// List process records
    List {
        #[arg(long)]
        pattern: Option<String>,

        #[arg(long)]
        namespace: Option<String>,
    },

    /// Aggregate launcher health
    Health {
        /// Include per-process records
        #[arg(long)]
        processes: bool,
    },
}

fn exit_code_for(e: &PrismError) -> ExitCode {
    match e.kind() {
        ErrorKind::NotFound => ExitCode::from(2),
        ErrorKind::Validation => ExitCode::from(3),
        ErrorKind::Conflict => ExitCode::from(4),
        _ => ExitCode::from(1),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("PRISM_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            exit_code_for(&e)
        }
    }
}

async fn run(cli: &Cli) -> Result<(), PrismError> {
    let client = RpcClient::connect_timeout(&cli.launcher, Duration::from_secs(5)).await?;

    match &cli.command {
        Commands::Launch {
            pattern,
            isolation,
            namespace,
            session_id,
            config,
        } => {
            let raw = std::fs::read_to_string(config).map_err(|e| {
                PrismError::validation(format!("reading {}: {e}", config.display()))
            })?;
            let pattern_config: PatternConfig = toml::from_str(&raw).map_err(|e| {
                PrismError::validation(format!("parsing {}: {e}", config.display()))
            })?;
            let reply = client
                .call_value(
                    launcher_methods::LAUNCH,
                    serde_json::json!({
                        "pattern_name": pattern,
                        "isolation": isolation,
                        "namespace": namespace,
                        "session_id": session_id,
                        "config": pattern_config,
                    }),
                    CALL_TIMEOUT,
                )
                .await?;
            match cli.format {
                OutputFormat::Json => print_json(&reply)?,
                _ => {
                    println!(
                        "{} {} at {}",
                        "launched".green().bold(),
                        reply["process_id"].as_str().unwrap_or("?"),
                        reply["address"].as_str().unwrap_or("-"),
                    );
                }
            }
        }

        Commands::Terminate { process_id, grace } => {
            client
                .call_value(
                    launcher_methods::TERMINATE,
                    serde_json::json!({
                        "process_id": process_id,
                        "grace_period_secs": grace,
                    }),
                    Duration::from_secs(*grace + 10),
                )
                .await?;
            println!("{} {process_id}", "terminated".green().bold());
        }

        Commands::Status { process_id } => {
            let record = client
                .call_value(
                    launcher_methods::STATUS,
                    serde_json::json!({ "process_id": process_id }),
                    CALL_TIMEOUT,
                )
                .await?;
            match cli.format {
                OutputFormat::Json => print_json(&record)?,
                OutputFormat::Table => print_record_table(std::slice::from_ref(&record)),
                OutputFormat::Text => print_record_text(&record),
            }
        }

        Commands::List { pattern, namespace } => {
            let records = client
                .call_value(
                    launcher_methods::LIST,
                    serde_json::json!({
                        "pattern_name": pattern,
                        "namespace": namespace,
                    }),
                    CALL_TIMEOUT,
                )
                .await?;
            let records = records.as_array().cloned().unwrap_or_default();
            match cli.format {
                OutputFormat::Json => print_json(&serde_json::Value::Array(records))?,
                OutputFormat::Table => print_record_table(&records),
                OutputFormat::Text => {
                    for record in &records {
                        print_record_text(record);
                    }
                }
            }
        }

        Commands::Health { processes } => {
            let health = client
                .call_value(
                    launcher_methods::HEALTH,
                    serde_json::json!({ "include_processes": processes }),
                    CALL_TIMEOUT,
                )
                .await?;
            match cli.format {
                OutputFormat::Json => print_json(&health)?,
                _ => {
                    println!(
                        "total {}  running {}  terminating {}  failed {}  uptime {}s",
                        health["total"],
                        health["running"].to_string().green(),
                        health["terminating"].to_string().yellow(),
                        health["failed"].to_string().red(),
                        health["uptime_secs"],
                    );
                    if let Some(records) = health["processes"].as_array() {
                        print_record_table(records);
                    }
                }
            }
        }
    }
    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<(), PrismError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn colored_state(state: &str) -> String {
    match state {
        "Running" => state.green().to_string(),
        "Failed" => state.red().to_string(),
        "Draining" | "Terminating" | "Starting" | "Pending" => state.yellow().to_string(),
        _ => state.to_string(),
    }
}

fn print_record_table(records: &[serde_json::Value]) {
    let mut table = Table::new();
    table.set_header(vec!["PROCESS ID", "PATTERN", "STATE", "HEALTHY", "PID", "DATA PLANE"]);
    for record in records {
        table.add_row(vec![
            record["process_id"].as_str().unwrap_or("?").to_string(),
            record["pattern_name"].as_str().unwrap_or("?").to_string(),
            colored_state(record["state"].as_str().unwrap_or("?")),
            record["healthy"].to_string(),
            record["pid"]
                .as_u64()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            record["data_plane_address"]
                .as_str()
                .unwrap_or("-")
                .to_string(),
        ]);
    }
    println!("{table}");
}

fn print_record_text(record: &serde_json::Value) {
    println!(
        "{} pattern={} state={} healthy={} pid={} data={}",
        record["process_id"].as_str().unwrap_or("?"),
        record["pattern_name"].as_str().unwrap_or("?"),
        record["state"].as_str().unwrap_or("?"),
        record["healthy"],
        record["pid"].as_u64().unwrap_or(0),
        record["data_plane_address"].as_str().unwrap_or("-"),
    );
}
