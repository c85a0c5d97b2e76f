//! Stratus Operator
//!
//! Cluster API infrastructure provider for Stratus machines.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use kube::CustomResourceExt;
use std::sync::Arc;
use stratus_operator::{
    config::OperatorConfig,
    controllers::{Context, StratusMachineController},
    crds::StratusMachine,
    telemetry::{init_tracing, TracingConfig},
};
use tracing::info;

#[derive(Parser)]
#[command(name = "stratus-operator")]
#[command(about = "Cluster API infrastructure provider for Stratus machines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print CRD manifests to stdout
    Crds,
    /// Run the operator
    Run {
        /// Field manager recorded on patches
        #[arg(long, env = "FIELD_MANAGER")]
        field_manager: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Crds => print_crds(),
        Commands::Run { field_manager } => run_operator(field_manager).await,
    }
}

fn print_crds() -> anyhow::Result<()> {
    println!("---");
    println!(
        "{}",
        serde_yaml::to_string(&StratusMachine::crd())
            .context("failed to serialize StratusMachine CRD")?
    );
    Ok(())
}

async fn run_operator(field_manager: Option<String>) -> anyhow::Result<()> {
    init_tracing(TracingConfig::from_env())
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let mut config = OperatorConfig::from_env();
    if let Some(field_manager) = field_manager {
        config.field_manager = field_manager;
    }
    info!(field_manager = %config.field_manager, "Starting stratus-operator");

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes");

    let ctx = Arc::new(Context::new(client.clone(), config));
    StratusMachineController::run(client, ctx).await;

    Ok(())
}
