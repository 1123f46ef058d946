use anyhow::{Context, Result};
use clap::Parser;
use dynconf::common::{Config, LedgerBackend, NodeConfig};
use dynconf::NodeServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "dynconf-node")]
#[command(about = "dynconf node - serves the configuration change protocol")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, default_value = "dynconf.toml")]
    config: PathBuf,

    /// Node name (must match a node in the cluster configuration)
    #[arg(short, long)]
    name: Option<String>,

    /// HTTP address to listen on
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Data directory for the ledger and snapshots
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Ledger backend (rocksdb, sled, memory)
    #[arg(long)]
    ledger: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

fn parse_ledger(s: &str) -> Result<LedgerBackend> {
    match s.to_ascii_lowercase().as_str() {
        "rocksdb" => Ok(LedgerBackend::Rocksdb),
        "sled" => Ok(LedgerBackend::Sled),
        "memory" => Ok(LedgerBackend::Memory),
        other => anyhow::bail!("unknown ledger backend: {}", other),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let level = args
        .log_level
        .clone()
        .or_else(|| Some(config.log_level.clone()).filter(|l| !l.is_empty()))
        .unwrap_or_else(|| "info".into());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut node = match (config.node, args.name) {
        (Some(mut node), Some(name)) => {
            node.name = name;
            node
        }
        (Some(node), None) => node,
        (None, Some(name)) => NodeConfig::new(name),
        (None, None) => anyhow::bail!("node name missing: pass --name or set node.name"),
    };
    if let Some(bind) = args.bind {
        node.bind_addr = bind;
    }
    if let Some(dir) = args.data_dir {
        node.data_dir = dir;
    }
    if let Some(ledger) = args.ledger.as_deref() {
        node.ledger = parse_ledger(ledger)?;
    }

    tracing::info!("Starting dynconf {}", dynconf::BUILD_INFO);
    let server = NodeServer::open(node)?;
    server.serve().await?;

    Ok(())
}
