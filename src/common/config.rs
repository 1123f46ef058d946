//! Configuration for dynconf components
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables prefixed with `DYNCONF__` (for example
//! `DYNCONF__ORCHESTRATOR__CALL_TIMEOUT_MS=2000`).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node-specific config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeConfig>,

    /// Orchestrator (CLI) config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator: Option<OrchestratorConfig>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Which ledger implementation a node persists its state in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    Memory,
    #[default]
    Rocksdb,
    Sled,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name, must match a node of the cluster configuration
    pub name: String,

    /// Bind address for the protocol HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Directory holding the ledger and config snapshots
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub ledger: LedgerBackend,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9410))
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./dynconf-data")
}

impl NodeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bind_addr: default_bind_addr(),
            data_dir: default_data_dir(),
            ledger: LedgerBackend::default(),
        }
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("config")
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Per-call timeout for every endpoint request
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Upper bound on concurrent in-flight endpoint calls
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Override for the host recorded against mutations
    #[serde(default)]
    pub host: Option<String>,

    /// Override for the user recorded against mutations
    #[serde(default)]
    pub user: Option<String>,
}

fn default_call_timeout() -> u64 {
    10_000
}
fn default_max_concurrency() -> usize {
    16
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout(),
            max_concurrency: default_max_concurrency(),
            host: None,
            user: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.max_concurrency == 0 {
            return Err(crate::Error::InvalidConfig(
                "orchestrator.max_concurrency must be at least 1".into(),
            ));
        }
        if self.call_timeout_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "orchestrator.call_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Host and user to record, with configured overrides applied.
    pub fn environment(&self) -> crate::common::utils::Environment {
        let mut env = crate::common::utils::Environment::from_system();
        if let Some(host) = &self.host {
            env.host = host.clone();
        }
        if let Some(user) = &self.user {
            env.user = user.clone();
        }
        env
    }
}

impl Config {
    /// Load from an explicit file plus the environment. A missing file is
    /// not an error.
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let built = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("DYNCONF")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;

        let config: Config = built
            .try_deserialize()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if let Some(node) = &self.node {
            if node.name.trim().is_empty() {
                return Err(crate::Error::InvalidConfig("node.name is empty".into()));
            }
        }
        if let Some(orch) = &self.orchestrator {
            orch.validate()?;
        }
        Ok(())
    }

    pub fn orchestrator_or_default(&self) -> OrchestratorConfig {
        self.orchestrator.clone().unwrap_or_default()
    }
}
