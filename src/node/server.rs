//! Node server

use crate::applicator::{ChangeApplicator, RoutingApplicator};
use crate::common::storage::open_ledger;
use crate::common::{LedgerBackend, NodeConfig, Result};
use crate::node::http::{create_router, NodeHttpState};
use crate::node::protocol::ProtocolServer;
use crate::node::snapshot::{FileSnapshotStore, MemSnapshotStore, SnapshotStorage};
use crate::node::state::NodeStateStore;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

pub struct NodeServer {
    config: NodeConfig,
    protocol: Arc<ProtocolServer>,
}

impl NodeServer {
    /// Open the node's durable state with the default change handlers.
    pub fn open(config: NodeConfig) -> Result<Self> {
        let applicator = Arc::new(RoutingApplicator::with_defaults(&config.name));
        Self::open_with_applicator(config, applicator)
    }

    pub fn open_with_applicator(
        config: NodeConfig,
        applicator: Arc<dyn ChangeApplicator>,
    ) -> Result<Self> {
        if config.ledger != LedgerBackend::Memory {
            std::fs::create_dir_all(&config.data_dir)?;
        }
        let ledger = open_ledger(config.ledger, &config.data_dir)?;
        let snapshots: Arc<dyn SnapshotStorage> = match config.ledger {
            LedgerBackend::Memory => Arc::new(MemSnapshotStore::new()),
            _ => Arc::new(FileSnapshotStore::open(config.snapshot_dir(), &config.name)?),
        };
        let store = NodeStateStore::open(ledger, snapshots)?;
        let protocol = Arc::new(ProtocolServer::new(&config.name, store, applicator)?);
        Ok(Self { config, protocol })
    }

    pub fn protocol(&self) -> Arc<ProtocolServer> {
        self.protocol.clone()
    }

    /// Serve until Ctrl-C.
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve_on(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve_on<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!("Starting node: {}", self.config.name);
        tracing::info!("  HTTP API: {}", listener.local_addr()?);
        tracing::info!("  Data path: {}", self.config.data_dir.display());
        tracing::info!("  Ledger: {:?}", self.config.ledger);

        let mut config_rx = self.protocol.subscribe();
        let node_name = self.config.name.clone();
        let watcher = tokio::spawn(async move {
            while config_rx.changed().await.is_ok() {
                let nodes = config_rx
                    .borrow_and_update()
                    .as_ref()
                    .map(|c| c.cluster.node_count());
                tracing::info!(node = %node_name, nodes = ?nodes, "Committed configuration changed");
            }
        });

        let router = create_router(NodeHttpState {
            protocol: self.protocol.clone(),
        });

        tracing::info!("✓ Node ready");
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await;
        watcher.abort();

        if let Err(e) = result {
            tracing::error!("HTTP server error: {}", e);
            return Err(e.into());
        }
        tracing::info!("Node stopped");
        Ok(())
    }
}
