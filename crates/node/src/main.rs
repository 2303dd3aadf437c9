// Path: crates/node/src/main.rs
#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::unimplemented,
        clippy::todo,
        clippy::indexing_slicing
    )
)]

//! # Meridian
//!
//! The placement-driver binary: starts a replica, joins it to a cluster,
//! or inspects configuration. Runtime reconfiguration goes through the
//! admin surface, not signals.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use meridian_server::{PdServer, PdService};
use meridian_store::{CoordKv, MemStore};
use meridian_types::{ErrorCode, PdError};
use tracing::{error, info};

mod settings;

const EXIT_OK: u8 = 0;
const EXIT_FATAL: u8 = 1;
const EXIT_CLUSTER_MISMATCH: u8 = 2;
const EXIT_BOOTSTRAP_CONFLICT: u8 = 3;

#[derive(Parser, Debug)]
#[clap(
    name = "meridian",
    version,
    about = "The Meridian placement driver.",
    long_about = "Meridian is the control plane for a range-sharded KV cluster: it owns \
                  cluster metadata, allocates IDs and timestamps, and schedules replica placement."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a replica (bootstrapping a new cluster if none exists).
    Start(StartArgs),

    /// Start a replica joining an existing cluster's coordination store.
    Join(StartArgs),

    /// Print the effective configuration and exit.
    Config(ConfigArgs),
}

#[derive(clap::Args, Debug)]
struct StartArgs {
    /// Path to the toml configuration file.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Replica name; overrides the config file.
    #[clap(long)]
    name: Option<String>,

    /// Client URL to advertise; overrides the config file.
    #[clap(long)]
    client_url: Option<String>,
}

#[derive(clap::Args, Debug)]
struct ConfigArgs {
    /// Path to the toml configuration file.
    #[clap(long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    if let Err(e) = meridian_telemetry::init_tracing() {
        eprintln!("failed to initialize tracing: {e}");
        return ExitCode::from(EXIT_FATAL);
    }
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(target: "node", error = %e, "failed to build the runtime");
            return ExitCode::from(EXIT_FATAL);
        }
    };
    let result = runtime.block_on(async {
        match cli.command {
            Commands::Start(args) | Commands::Join(args) => run_replica(args).await,
            Commands::Config(args) => print_config(args),
        }
    });
    match result {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(e) => {
            error!(target: "node", error = %e, code = e.code(), "fatal");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn exit_code_for(e: &PdError) -> u8 {
    match e {
        PdError::ClusterMismatch { .. } => EXIT_CLUSTER_MISMATCH,
        PdError::AlreadyBootstrapped => EXIT_BOOTSTRAP_CONFLICT,
        _ => EXIT_FATAL,
    }
}

async fn run_replica(args: StartArgs) -> Result<(), PdError> {
    let mut config = settings::load(args.config.as_deref())?;
    if let Some(name) = args.name {
        config.name = name;
    }
    if let Some(url) = args.client_url {
        config.client_urls = vec![url];
    }
    settings::validate(&config)?;

    // The embedded Coordination Store; an etcd-backed adapter slots in
    // here for multi-node deployments.
    let mem = Arc::new(MemStore::new());
    let kv: Arc<dyn CoordKv> = Arc::clone(&mem) as Arc<dyn CoordKv>;
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    mem.start_lease_sweeper(shutdown_rx.clone());

    let server = PdServer::new(kv, config);
    PdService::new(Arc::clone(&server))
        .register_participant()
        .await?;
    info!(target: "node", name = %server.member().name, "replica starting");

    let replica = Arc::clone(&server);
    let run = tokio::spawn(async move { replica.run(shutdown_rx).await });

    if tokio::signal::ctrl_c().await.is_err() {
        return Err(PdError::Internal("signal handler failed".into()));
    }
    info!(target: "node", "shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = run.await;
    info!(target: "node", "replica stopped");
    Ok(())
}

fn print_config(args: ConfigArgs) -> Result<(), PdError> {
    let config = settings::load(args.config.as_deref())?;
    let rendered = toml::to_string_pretty(&config)
        .map_err(|e| PdError::Internal(format!("config render: {e}")))?;
    println!("{rendered}");
    Ok(())
}
