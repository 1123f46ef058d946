//! CLI for cluster operations

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dynconf::applicator::{Applicability, Change, Cluster, Node};
use dynconf::common::utils::ChangeIdGenerator;
use dynconf::common::{Config, LedgerBackend, NodeConfig};
use dynconf::ops::{repair_cluster, takeover_cluster, verify_node};
use dynconf::orchestrator::{
    HttpEndpoint, LoggingReceiver, NoopReceiver, Orchestrator, RepairAction, RunReport,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "dynconf")]
#[command(about = "dynconf cluster configuration CLI")]
#[command(version)]
struct Cli {
    /// Comma separated node addresses
    #[arg(long, short, default_value = "localhost:9410")]
    endpoints: String,

    /// Configuration file (TOML)
    #[arg(long, default_value = "dynconf.toml")]
    config: PathBuf,

    /// Per-call timeout in milliseconds (overrides the config file)
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Force {
    Commit,
    Rollback,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the state of every node
    Status,

    /// Activate a cluster from a JSON description
    Activate {
        /// Cluster JSON file
        #[arg(long)]
        file: PathBuf,
    },

    /// Set a setting
    Set {
        name: String,
        value: String,

        /// Only on this stripe
        #[arg(long, conflicts_with = "node")]
        stripe: Option<String>,

        /// Only on this node
        #[arg(long)]
        node: Option<String>,
    },

    /// Remove a setting
    Unset {
        name: String,

        #[arg(long, conflicts_with = "node")]
        stripe: Option<String>,

        #[arg(long)]
        node: Option<String>,
    },

    /// Add a node to a stripe
    Attach {
        #[arg(long)]
        stripe: String,

        /// Name of the new node
        #[arg(long)]
        name: String,

        /// Address of the new node
        #[arg(long)]
        address: String,
    },

    /// Remove a node from the cluster
    Detach {
        node: String,
    },

    /// Finish a change left prepared on some nodes
    Repair {
        /// Outcome to force when every node is prepared
        #[arg(long, value_enum)]
        force: Option<Force>,
    },

    /// Take every node over from a vanished operator
    Takeover,

    /// Verify a stopped node's snapshots against its ledger
    Verify {
        #[arg(long)]
        name: String,

        #[arg(long)]
        data_dir: PathBuf,

        /// Use the sled ledger instead of rocksdb
        #[arg(long)]
        sled: bool,
    },
}

fn scope(stripe: Option<String>, node: Option<String>) -> Applicability {
    match (stripe, node) {
        (Some(stripe), _) => Applicability::stripe(stripe),
        (None, Some(node)) => Applicability::node(node),
        (None, None) => Applicability::Cluster,
    }
}

fn print_report(report: &RunReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    if !report.is_consistent() {
        anyhow::bail!("run finished with outcome {:?}", report.outcome);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let level = Some(config.log_level.clone())
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| "info".into());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut orch_config = config.orchestrator_or_default();
    if let Some(timeout_ms) = cli.timeout_ms {
        orch_config.call_timeout_ms = timeout_ms;
    }
    orch_config.validate().context("invalid orchestrator settings")?;

    let change = match cli.command {
        Commands::Status => {
            let orch = Orchestrator::new(
                HttpEndpoint::parse_list(&cli.endpoints)?,
                orch_config.environment(),
                Arc::new(ChangeIdGenerator::random()),
                orch_config,
            );
            let status = orch.status(&mut LoggingReceiver).await?;
            println!("Cluster state: {}", status.state);
            for (address, node) in &status.nodes {
                match node {
                    Ok(d) => println!(
                        "  {}: {} (count {}, version {}/{})",
                        address, d.mode, d.mutative_message_count, d.current_version, d.highest_version
                    ),
                    Err(e) => println!("  {}: unreachable ({})", address, e),
                }
            }
            return Ok(());
        }

        Commands::Activate { file } => {
            let body = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let cluster: Cluster = serde_json::from_slice(&body)?;
            Change::Activate { cluster }
        }

        Commands::Set {
            name,
            value,
            stripe,
            node,
        } => Change::set(scope(stripe, node), name, value),

        Commands::Unset { name, stripe, node } => Change::unset(scope(stripe, node), name),

        Commands::Attach {
            stripe,
            name,
            address,
        } => Change::AttachNode {
            stripe,
            node: Node::new(name, address),
        },

        Commands::Detach { node } => Change::DetachNode { node },

        Commands::Repair { force } => {
            let forced = force.map(|f| match f {
                Force::Commit => RepairAction::Commit,
                Force::Rollback => RepairAction::Rollback,
            });
            let report =
                repair_cluster(&cli.endpoints, forced, &orch_config, Box::new(NoopReceiver)).await?;
            return print_report(&report);
        }

        Commands::Takeover => {
            let report = takeover_cluster(&cli.endpoints, &orch_config, Box::new(NoopReceiver)).await?;
            return print_report(&report);
        }

        Commands::Verify {
            name,
            data_dir,
            sled,
        } => {
            let mut node = NodeConfig::new(name);
            node.data_dir = data_dir;
            if sled {
                node.ledger = LedgerBackend::Sled;
            }
            let report = verify_node(&node)?;
            println!("Verification report:");
            println!("  Committed changes: {}", report.checked);
            println!("  Healthy: {}", report.healthy);
            println!("  Missing: {:?}", report.missing);
            println!("  Corrupted: {:?}", report.corrupted);
            println!("  Orphaned: {:?}", report.orphaned);
            report.ensure_healthy()?;
            return Ok(());
        }
    };

    let orch = Orchestrator::new(
        HttpEndpoint::parse_list(&cli.endpoints)?,
        orch_config.environment(),
        Arc::new(ChangeIdGenerator::random()),
        orch_config,
    );
    let report = orch.apply_change(change, &mut LoggingReceiver).await?;
    print_report(&report)
}
