//! Verify a node's stored configuration history

use crate::common::messages::ChangeRequestState;
use crate::common::storage::open_ledger;
use crate::common::{Error, NodeConfig, Result};
use crate::node::{FileSnapshotStore, NodeStateStore};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Check every committed change of the node configured by `config` against
/// the snapshot stored for it. Opens the node's storage directly, so the
/// node must not be running.
pub fn verify_node(config: &NodeConfig) -> Result<VerifyReport> {
    tracing::info!("Verifying node {} at {}", config.name, config.data_dir.display());
    let ledger = open_ledger(config.ledger, &config.data_dir)?;
    let snapshots = Arc::new(FileSnapshotStore::open(config.snapshot_dir(), &config.name)?);
    let store = NodeStateStore::open(ledger, snapshots)?;
    verify_store(&store)
}

pub fn verify_store(store: &NodeStateStore) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();
    let mut committed_versions = BTreeSet::new();

    for record in store.list_changes()? {
        if record.state != ChangeRequestState::Committed {
            continue;
        }
        committed_versions.insert(record.version);
        report.checked += 1;
        match store.load_config(record.version, &record.result_hash) {
            Ok(_) => report.healthy += 1,
            Err(Error::NotFound(_)) => {
                tracing::warn!(version = record.version, change = %record.uuid, "Snapshot missing");
                report.missing.push(record.version);
            }
            Err(e @ (Error::HashMismatch { .. } | Error::Corrupted(_))) => {
                tracing::warn!(version = record.version, change = %record.uuid, "Snapshot corrupted: {}", e);
                report.corrupted.push(record.version);
            }
            Err(e) => return Err(e),
        }
    }

    // a snapshot is written before its ledger batch, so a crash can leave one behind
    for version in store.snapshot_versions()? {
        if !committed_versions.contains(&version) {
            report.orphaned.push(version);
        }
    }

    let state = store.load_state()?;
    if let Err(e) = store.current_committed_config(&state) {
        tracing::warn!("Current configuration unreadable: {}", e);
        report.current_unreadable = Some(e.to_string());
    }

    tracing::info!(
        checked = report.checked,
        healthy = report.healthy,
        missing = report.missing.len(),
        corrupted = report.corrupted.len(),
        orphaned = report.orphaned.len(),
        "Verification finished"
    );
    Ok(report)
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub checked: usize,
    pub healthy: usize,
    pub missing: Vec<u64>,
    pub corrupted: Vec<u64>,
    /// Snapshots with no committed change. Harmless.
    pub orphaned: Vec<u64>,
    pub current_unreadable: Option<String>,
}

impl VerifyReport {
    pub fn is_healthy(&self) -> bool {
        self.missing.is_empty() && self.corrupted.is_empty() && self.current_unreadable.is_none()
    }

    /// Turn an unhealthy report into an error.
    pub fn ensure_healthy(&self) -> Result<()> {
        if self.is_healthy() {
            return Ok(());
        }
        Err(Error::VerifyFailed(format!(
            "{} missing, {} corrupted snapshot(s){}",
            self.missing.len(),
            self.corrupted.len(),
            self.current_unreadable
                .as_ref()
                .map(|e| format!("; current configuration: {}", e))
                .unwrap_or_default()
        )))
    }
}
