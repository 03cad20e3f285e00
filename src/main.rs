//! Meshstrap CLI - cluster, mesh, and demo app in one pipeline

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use meshstrap::config::EnvironmentConfig;
use meshstrap::exec::ShellRunner;
use meshstrap::pipeline::Pipeline;

/// Provision a GKE cluster, install the managed service mesh, and deploy
/// a demo storefront
#[derive(Parser, Debug)]
#[command(name = "meshstrap", version, about, long_about = None)]
struct Cli {
    /// Path to the environment config file
    ///
    /// One YAML document describes the whole environment: project,
    /// cluster shape, mesh channel, and app options. Overridable per run
    /// with MESHSTRAP_PROJECT_ID / MESHSTRAP_CLUSTER_NAME /
    /// MESHSTRAP_CLUSTER_LOCATION.
    #[arg(
        short = 'f',
        long = "config",
        env = "MESHSTRAP_CONFIG",
        default_value = "meshstrap.yaml"
    )]
    config_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the full pipeline: cluster, mesh, injection, storefront
    Up,

    /// Create the cluster and fetch credentials, nothing else
    Provision,

    /// Install the managed mesh and label namespaces for injection
    Mesh,

    /// Deploy the storefront and probe it through the gateway
    Deploy,

    /// Observe the environment and print a health report
    ///
    /// Exits nonzero when anything is missing or unhealthy, so it can
    /// gate CI jobs.
    Verify,

    /// Delete the application namespace and the cluster
    Destroy(DestroyArgs),
}

/// Destroy mode arguments
#[derive(Parser, Debug)]
struct DestroyArgs {
    /// Delete only the application namespace, keep the cluster
    #[arg(long)]
    keep_cluster: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = EnvironmentConfig::load(&cli.config_file).await?;

    println!("=== Meshstrap ===");
    println!("Config file: {}", cli.config_file.display());
    println!("Project:     {}", config.project.id);
    println!("Cluster:     {} ({})", config.cluster.name, config.location());
    println!(
        "Mesh:        managed, {} channel",
        config.mesh.channel
    );

    // Ctrl-C flips the token; in-flight waits resolve with a Cancelled
    // error naming the interrupted phase.
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupt received, stopping after the current operation...");
            signal_token.cancel();
        }
    });

    let pipeline = Pipeline::new(config, Arc::new(ShellRunner::new()), cancel);

    match cli.command {
        Commands::Up => pipeline.up().await?,
        Commands::Provision => pipeline.provision().await?,
        Commands::Mesh => pipeline.mesh().await?,
        Commands::Deploy => pipeline.deploy().await?,
        Commands::Verify => {
            let report = pipeline.verify().await?;
            if !report.healthy() {
                std::process::exit(1);
            }
        }
        Commands::Destroy(args) => pipeline.destroy(args.keep_cluster).await?,
    }

    Ok(())
}
