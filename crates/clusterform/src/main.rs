mod commands;
mod utils;

use clap::{Parser, Subcommand};
use clusterform_state::Provider;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "clusterform")]
#[command(about = "Provision Kubernetes clusters across clouds with terraform", long_about = None)]
struct Cli {
    /// Config file (default: clusterform.yaml, then ~/.config/clusterform/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a cluster manager, cluster or nodes
    #[command(subcommand)]
    Create(CreateCommands),
    /// Destroy a cluster manager, cluster or nodes
    #[command(subcommand)]
    Destroy(DestroyCommands),
    /// Print a manager's state document, or one value from it
    Get {
        /// Cluster manager name
        manager: String,
        /// Dotted path such as module.cluster-manager.name
        path: Option<String>,
    },
    /// List cluster managers with stored state
    List,
    /// Show version information
    Version,
}

#[derive(Subcommand)]
pub enum CreateCommands {
    /// Create a cluster manager
    Manager {
        /// Cluster manager name
        #[arg(long)]
        name: String,
        /// Cloud provider (triton, aws, azure, gcp, bare-metal, vsphere)
        #[arg(long, value_parser = parse_provider)]
        provider: Provider,
        /// Module setting, repeatable (value parsed as JSON when possible)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },
    /// Add a cluster to a cluster manager
    Cluster {
        /// Cluster manager name
        #[arg(long)]
        manager: String,
        /// Cluster name
        #[arg(long)]
        name: String,
        /// Cloud provider (triton, aws, azure, gcp, bare-metal, vsphere)
        #[arg(long, value_parser = parse_provider)]
        provider: Provider,
        /// Module setting, repeatable (value parsed as JSON when possible)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },
    /// Add nodes to a cluster
    Node {
        /// Cluster manager name
        #[arg(long)]
        manager: String,
        /// Cluster name
        #[arg(long)]
        cluster: String,
        /// Hostname; numbered when taken or when creating several nodes
        #[arg(long)]
        hostname: String,
        /// Number of nodes to create
        #[arg(long, default_value = "1")]
        count: usize,
        /// Cloud provider; must match the cluster's
        #[arg(long, value_parser = parse_provider)]
        provider: Option<Provider>,
        /// Module setting, repeatable (value parsed as JSON when possible)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum DestroyCommands {
    /// Destroy a cluster manager and everything under it
    Manager {
        /// Cluster manager name
        manager: String,
    },
    /// Destroy a cluster and its nodes
    Cluster {
        /// Cluster manager name
        #[arg(long)]
        manager: String,
        /// Cluster name
        name: String,
    },
    /// Destroy nodes of a cluster
    Node {
        /// Cluster manager name
        #[arg(long)]
        manager: String,
        /// Cluster name
        #[arg(long)]
        cluster: String,
        /// Hostnames of the nodes
        #[arg(required = true)]
        hostnames: Vec<String>,
    },
}

fn parse_provider(s: &str) -> Result<Provider, String> {
    s.parse::<Provider>().map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let settings = clusterform_config::Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Create(command) => commands::create::handle(command, &settings).await?,
        Commands::Destroy(command) => commands::destroy::handle(command, &settings).await?,
        Commands::Get { manager, path } => {
            commands::get::handle(&settings, &manager, path.as_deref()).await?
        }
        Commands::List => commands::list::handle(&settings).await?,
        Commands::Version => commands::version::handle(&settings).await,
    }

    Ok(())
}
