//! Durable node protocol state
//!
//! Stores:
//! - Scalar protocol fields under `state/<field>`
//! - One change request record per change under `change/<uuid>`
//!
//! Every mutation is one [`StateChange`], written as a single ledger
//! batch. A configuration snapshot carried by the change is written
//! first; it is unreachable until the batch that references it lands.

use crate::applicator::{Change, NodeContext};
use crate::common::hash::config_hash;
use crate::common::messages::{ChangeDetails, ChangeRequestState, NodeMode};
use crate::common::storage::{Ledger, LedgerOp};
use crate::node::snapshot::SnapshotStorage;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

const KEY_INITIALIZED: &str = "state/initialized";
const KEY_MODE: &str = "state/mode";
const KEY_COUNT: &str = "state/mutativeMessageCount";
const KEY_LAST_HOST: &str = "state/lastMutationHost";
const KEY_LAST_USER: &str = "state/lastMutationUser";
const KEY_LAST_TIMESTAMP: &str = "state/lastMutationTimestamp";
const KEY_LATEST_CHANGE: &str = "state/latestChangeUuid";
const KEY_CURRENT_VERSION: &str = "state/currentVersion";
const KEY_HIGHEST_VERSION: &str = "state/highestVersion";
const CHANGE_PREFIX: &str = "change/";

fn change_key(uuid: Uuid) -> String {
    format!("{}{}", CHANGE_PREFIX, uuid)
}

/// Durable record of one change at this node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub uuid: Uuid,
    pub state: ChangeRequestState,
    pub version: u64,
    pub change: Change,
    pub result_hash: String,
    pub creation_host: String,
    pub creation_user: String,
    pub creation_timestamp: DateTime<Utc>,
    /// Change that was latest when this one was prepared.
    pub prev_change_uuid: Option<Uuid>,
}

impl ChangeRequest {
    pub fn to_details(&self, result: Option<NodeContext>) -> ChangeDetails {
        ChangeDetails {
            uuid: self.uuid,
            state: self.state,
            version: self.version,
            change: self.change.clone(),
            result,
            result_hash: self.result_hash.clone(),
            creation_host: self.creation_host.clone(),
            creation_user: self.creation_user.clone(),
            creation_timestamp: self.creation_timestamp,
        }
    }
}

/// Scalar protocol fields of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeProtocolState {
    pub mode: NodeMode,
    pub mutative_message_count: u64,
    pub last_mutation_host: Option<String>,
    pub last_mutation_user: Option<String>,
    pub last_mutation_timestamp: Option<DateTime<Utc>>,
    pub latest_change_uuid: Option<Uuid>,
    pub current_version: u64,
    pub highest_version: u64,
}

impl Default for NodeProtocolState {
    fn default() -> Self {
        Self {
            mode: NodeMode::Accepting,
            mutative_message_count: 0,
            last_mutation_host: None,
            last_mutation_user: None,
            last_mutation_timestamp: None,
            latest_change_uuid: None,
            current_version: 0,
            highest_version: 0,
        }
    }
}

/// One atomic state delta. Always advances the mutative message count by
/// exactly one over the state it was started from.
#[derive(Debug)]
pub struct StateChange {
    base_count: u64,
    ops: Vec<LedgerOp>,
    snapshot: Option<(u64, NodeContext)>,
}

impl StateChange {
    fn new(base: &NodeProtocolState) -> Self {
        let next = base.mutative_message_count + 1;
        Self {
            base_count: base.mutative_message_count,
            ops: vec![LedgerOp::Put(KEY_COUNT.into(), encode_u64(next))],
            snapshot: None,
        }
    }

    pub fn mode(mut self, mode: NodeMode) -> Self {
        self.ops
            .push(LedgerOp::Put(KEY_MODE.into(), mode.to_string().into_bytes()));
        self
    }

    pub fn last_mutation(mut self, host: &str, user: &str, timestamp: DateTime<Utc>) -> Self {
        self.ops
            .push(LedgerOp::Put(KEY_LAST_HOST.into(), host.as_bytes().to_vec()));
        self.ops
            .push(LedgerOp::Put(KEY_LAST_USER.into(), user.as_bytes().to_vec()));
        self.ops.push(LedgerOp::Put(
            KEY_LAST_TIMESTAMP.into(),
            timestamp.to_rfc3339().into_bytes(),
        ));
        self
    }

    pub fn latest_change(mut self, uuid: Uuid) -> Self {
        self.ops.push(LedgerOp::Put(
            KEY_LATEST_CHANGE.into(),
            uuid.to_string().into_bytes(),
        ));
        self
    }

    pub fn current_version(mut self, version: u64) -> Self {
        self.ops
            .push(LedgerOp::Put(KEY_CURRENT_VERSION.into(), encode_u64(version)));
        self
    }

    pub fn highest_version(mut self, version: u64) -> Self {
        self.ops
            .push(LedgerOp::Put(KEY_HIGHEST_VERSION.into(), encode_u64(version)));
        self
    }

    pub fn change_request(mut self, record: &ChangeRequest) -> Result<Self> {
        let bytes = bincode::serialize(record)
            .map_err(|e| Error::Internal(format!("Serialize error: {}", e)))?;
        self.ops.push(LedgerOp::Put(change_key(record.uuid), bytes));
        Ok(self)
    }

    pub fn snapshot(mut self, version: u64, config: NodeContext) -> Self {
        self.snapshot = Some((version, config));
        self
    }
}

fn encode_u64(v: u64) -> Vec<u8> {
    v.to_be_bytes().to_vec()
}

fn decode_u64(field: &str, bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Corrupted(format!("{} is not a u64", field)))?;
    Ok(u64::from_be_bytes(arr))
}

fn decode_string(field: &str, bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|_| Error::Corrupted(format!("{} is not utf-8", field)))
}

/// Ledger plus snapshot storage of one node.
pub struct NodeStateStore {
    ledger: Arc<dyn Ledger>,
    snapshots: Arc<dyn SnapshotStorage>,
}

impl NodeStateStore {
    /// Open the store, writing the initial state on first use.
    pub fn open(ledger: Arc<dyn Ledger>, snapshots: Arc<dyn SnapshotStorage>) -> Result<Self> {
        let store = Self { ledger, snapshots };
        if store.ledger.get(KEY_INITIALIZED)?.is_none() {
            store.initialize()?;
        }
        Ok(store)
    }

    fn initialize(&self) -> Result<()> {
        tracing::info!("Initializing node protocol state");
        self.ledger.write_batch(vec![
            LedgerOp::Put(KEY_MODE.into(), NodeMode::Accepting.to_string().into_bytes()),
            LedgerOp::Put(KEY_COUNT.into(), encode_u64(0)),
            LedgerOp::Put(KEY_CURRENT_VERSION.into(), encode_u64(0)),
            LedgerOp::Put(KEY_HIGHEST_VERSION.into(), encode_u64(0)),
            LedgerOp::Put(KEY_INITIALIZED.into(), vec![1]),
        ])
    }

    /// Read every scalar field from one consistent view.
    pub fn load_state(&self) -> Result<NodeProtocolState> {
        let keys = [
            KEY_MODE,
            KEY_COUNT,
            KEY_LAST_HOST,
            KEY_LAST_USER,
            KEY_LAST_TIMESTAMP,
            KEY_LATEST_CHANGE,
            KEY_CURRENT_VERSION,
            KEY_HIGHEST_VERSION,
        ];
        let mut values = self.ledger.get_many(&keys)?.into_iter();
        let mut next = || values.next().flatten();

        let mode = match next() {
            Some(bytes) => decode_string(KEY_MODE, bytes)?
                .parse::<NodeMode>()
                .map_err(Error::Corrupted)?,
            None => return Err(Error::Corrupted("node state is missing its mode".into())),
        };
        let count = next()
            .map(|b| decode_u64(KEY_COUNT, &b))
            .transpose()?
            .unwrap_or(0);
        let host = next().map(|b| decode_string(KEY_LAST_HOST, b)).transpose()?;
        let user = next().map(|b| decode_string(KEY_LAST_USER, b)).transpose()?;
        let timestamp = next()
            .map(|b| -> Result<DateTime<Utc>> {
                let s = decode_string(KEY_LAST_TIMESTAMP, b)?;
                DateTime::parse_from_rfc3339(&s)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| Error::Corrupted(format!("bad mutation timestamp: {}", e)))
            })
            .transpose()?;
        let latest = next()
            .map(|b| -> Result<Uuid> {
                let s = decode_string(KEY_LATEST_CHANGE, b)?;
                Uuid::parse_str(&s).map_err(|e| Error::Corrupted(format!("bad change uuid: {}", e)))
            })
            .transpose()?;
        let current = next()
            .map(|b| decode_u64(KEY_CURRENT_VERSION, &b))
            .transpose()?
            .unwrap_or(0);
        let highest = next()
            .map(|b| decode_u64(KEY_HIGHEST_VERSION, &b))
            .transpose()?
            .unwrap_or(0);

        Ok(NodeProtocolState {
            mode,
            mutative_message_count: count,
            last_mutation_host: host,
            last_mutation_user: user,
            last_mutation_timestamp: timestamp,
            latest_change_uuid: latest,
            current_version: current,
            highest_version: highest,
        })
    }

    /// Start a state change on top of `base`.
    pub fn begin(&self, base: &NodeProtocolState) -> StateChange {
        StateChange::new(base)
    }

    /// Persist a state change. The count must not have moved since the
    /// change was started.
    pub fn apply(&self, change: StateChange) -> Result<()> {
        let stored = self
            .ledger
            .get(KEY_COUNT)?
            .map(|b| decode_u64(KEY_COUNT, &b))
            .transpose()?
            .unwrap_or(0);
        if stored != change.base_count {
            return Err(Error::FenceViolation {
                expected: change.base_count,
                actual: stored,
            });
        }
        if let Some((version, config)) = &change.snapshot {
            self.snapshots.save(*version, config)?;
        }
        self.ledger.write_batch(change.ops)
    }

    pub fn get_change(&self, uuid: Uuid) -> Result<Option<ChangeRequest>> {
        match self.ledger.get(&change_key(uuid))? {
            Some(bytes) => {
                let record = bincode::deserialize(&bytes)
                    .map_err(|e| Error::Corrupted(format!("change {}: {}", uuid, e)))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Every change request in the ledger, ordered by version.
    pub fn list_changes(&self) -> Result<Vec<ChangeRequest>> {
        let mut records = Vec::new();
        for (key, bytes) in self.ledger.scan_prefix(CHANGE_PREFIX)? {
            let record: ChangeRequest = bincode::deserialize(&bytes)
                .map_err(|e| Error::Corrupted(format!("{}: {}", key, e)))?;
            records.push(record);
        }
        records.sort_by_key(|r| r.version);
        Ok(records)
    }

    /// Newest committed change, walking back from the latest change.
    pub fn latest_committed_change(
        &self,
        state: &NodeProtocolState,
    ) -> Result<Option<ChangeRequest>> {
        let mut cursor = state.latest_change_uuid;
        while let Some(uuid) = cursor {
            let record = self
                .get_change(uuid)?
                .ok_or_else(|| Error::Corrupted(format!("change {} is referenced but missing", uuid)))?;
            if record.state == ChangeRequestState::Committed {
                return Ok(Some(record));
            }
            cursor = record.prev_change_uuid;
        }
        Ok(None)
    }

    /// Load the snapshot at `version` and check it against `expected_hash`.
    pub fn load_config(&self, version: u64, expected_hash: &str) -> Result<NodeContext> {
        let config = self
            .snapshots
            .load(version)?
            .ok_or_else(|| Error::NotFound(format!("config snapshot for version {}", version)))?;
        let actual = config_hash(&config)?;
        if actual != expected_hash {
            return Err(Error::HashMismatch {
                version,
                expected: expected_hash.to_string(),
                actual,
            });
        }
        Ok(config)
    }

    /// Configuration at `current_version`, verified, or None before the
    /// first commit.
    pub fn current_committed_config(
        &self,
        state: &NodeProtocolState,
    ) -> Result<Option<NodeContext>> {
        if state.current_version == 0 {
            return Ok(None);
        }
        let record = self.latest_committed_change(state)?.ok_or_else(|| {
            Error::Corrupted(format!(
                "current version {} has no committed change",
                state.current_version
            ))
        })?;
        if record.version != state.current_version {
            return Err(Error::Corrupted(format!(
                "current version {} but latest committed change is version {}",
                state.current_version, record.version
            )));
        }
        self.load_config(record.version, &record.result_hash)
            .map(Some)
    }

    /// Versions that have a snapshot on disk.
    pub fn snapshot_versions(&self) -> Result<Vec<u64>> {
        self.snapshots.versions()
    }
}
