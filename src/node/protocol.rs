//! Per-node change protocol state machine
//!
//! A node is either ACCEPTING (no outstanding change) or PREPARED (one
//! change awaiting commit or rollback). Mutating requests are serialized
//! by a single lock and fenced by the mutative message count; discovery
//! takes no lock.
//!
//! Rejections are returned as [`AcceptRejectResponse`] values. Errors are
//! reserved for storage failure and corruption.

use crate::applicator::{ChangeApplicator, NodeContext, PotentialApplicationResult};
use crate::common::hash::config_hash;
use crate::common::messages::{
    AcceptRejectResponse, ChangeRequestState, CommitMessage, DiscoverResponse, NodeMode,
    PrepareMessage, RejectionReason, RollbackMessage, TakeoverMessage,
};
use crate::node::state::{ChangeRequest, NodeProtocolState, NodeStateStore};
use crate::{Error, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use uuid::Uuid;

/// Attempts at a torn-free discovery read before giving up.
const DISCOVER_ATTEMPTS: usize = 8;

pub struct ProtocolServer {
    node_name: String,
    store: NodeStateStore,
    applicator: Arc<dyn ChangeApplicator>,
    mutation_lock: Mutex<()>,
    committed_tx: watch::Sender<Option<NodeContext>>,
}

impl ProtocolServer {
    pub fn new(
        node_name: impl Into<String>,
        store: NodeStateStore,
        applicator: Arc<dyn ChangeApplicator>,
    ) -> Result<Self> {
        let node_name = node_name.into();
        let state = store.load_state()?;
        let committed = store.current_committed_config(&state)?;
        tracing::info!(
            node = %node_name,
            mode = %state.mode,
            current_version = state.current_version,
            highest_version = state.highest_version,
            "Protocol server ready"
        );
        let (committed_tx, _) = watch::channel(committed);
        Ok(Self {
            node_name,
            store,
            applicator,
            mutation_lock: Mutex::new(()),
            committed_tx,
        })
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.mutation_lock
            .lock()
            .map_err(|_| Error::Internal("mutation lock poisoned".into()))
    }

    fn reject(
        &self,
        state: &NodeProtocolState,
        reason: RejectionReason,
        message: impl Into<String>,
    ) -> AcceptRejectResponse {
        let message = message.into();
        tracing::debug!(node = %self.node_name, %reason, "Rejected: {}", message);
        AcceptRejectResponse::reject(
            reason,
            message,
            state.last_mutation_host.clone(),
            state.last_mutation_user.clone(),
        )
    }

    fn fence_rejection(
        &self,
        state: &NodeProtocolState,
        expected: u64,
    ) -> Option<AcceptRejectResponse> {
        if expected == state.mutative_message_count {
            return None;
        }
        Some(self.reject(
            state,
            RejectionReason::ConcurrentChange,
            format!(
                "expected mutative message count {} but node is at {}",
                expected, state.mutative_message_count
            ),
        ))
    }

    // === Queries ===

    /// Current protocol state. Never persists anything.
    pub fn discover(&self) -> Result<DiscoverResponse> {
        for _ in 0..DISCOVER_ATTEMPTS {
            let state = self.store.load_state()?;
            let latest = match state.latest_change_uuid {
                Some(uuid) => self.store.get_change(uuid)?,
                None => None,
            };
            let committed = self.store.latest_committed_change(&state)?;

            // a mutation landed between the reads; try again
            if self.store.load_state()?.mutative_message_count != state.mutative_message_count {
                continue;
            }

            let latest_change = match latest {
                Some(record) => Some(self.details(&record)?),
                None => None,
            };
            let latest_committed_change = match committed {
                Some(record) => Some(self.details(&record)?),
                None => None,
            };
            return Ok(DiscoverResponse {
                mode: state.mode,
                mutative_message_count: state.mutative_message_count,
                last_mutation_host: state.last_mutation_host,
                last_mutation_user: state.last_mutation_user,
                last_mutation_timestamp: state.last_mutation_timestamp,
                current_version: state.current_version,
                highest_version: state.highest_version,
                latest_change,
                latest_committed_change,
            });
        }
        Err(Error::Internal(
            "node state kept changing during discovery".into(),
        ))
    }

    fn details(&self, record: &ChangeRequest) -> Result<crate::common::messages::ChangeDetails> {
        let result = if record.state == ChangeRequestState::Committed {
            Some(self.store.load_config(record.version, &record.result_hash)?)
        } else {
            None
        };
        Ok(record.to_details(result))
    }

    pub fn has_incomplete_change(&self) -> Result<bool> {
        Ok(self.store.load_state()?.mode == NodeMode::Prepared)
    }

    pub fn change_request(&self, uuid: Uuid) -> Result<Option<ChangeRequest>> {
        self.store.get_change(uuid)
    }

    pub fn change_history(&self) -> Result<Vec<ChangeRequest>> {
        self.store.list_changes()
    }

    pub fn current_committed_config(&self) -> Result<Option<NodeContext>> {
        let state = self.store.load_state()?;
        self.store.current_committed_config(&state)
    }

    /// Committed configuration, updated after every commit.
    pub fn subscribe(&self) -> watch::Receiver<Option<NodeContext>> {
        self.committed_tx.subscribe()
    }

    pub(crate) fn store(&self) -> &NodeStateStore {
        &self.store
    }

    // === Mutations ===

    pub fn prepare(&self, msg: &PrepareMessage) -> Result<AcceptRejectResponse> {
        let _guard = self.lock()?;
        let state = self.store.load_state()?;

        if state.mode == NodeMode::Prepared && state.latest_change_uuid == Some(msg.change_uuid) {
            tracing::debug!(node = %self.node_name, change = %msg.change_uuid, "Retransmitted prepare");
            return Ok(AcceptRejectResponse::accept());
        }
        if let Some(rejection) = self.fence_rejection(&state, msg.expected_mutative_message_count) {
            return Ok(rejection);
        }
        if state.mode == NodeMode::Prepared {
            let pending = match state.latest_change_uuid {
                Some(uuid) => self.store.get_change(uuid)?,
                None => None,
            };
            let same_operator = pending.as_ref().is_some_and(|p| {
                p.creation_host == msg.mutation_host && p.creation_user == msg.mutation_user
            });
            let pending_id = pending
                .map(|p| p.uuid.to_string())
                .unwrap_or_else(|| "unknown".into());
            return Ok(if same_operator {
                self.reject(
                    &state,
                    RejectionReason::AlreadyPrepared,
                    format!("change {} is already prepared by this client", pending_id),
                )
            } else {
                self.reject(
                    &state,
                    RejectionReason::Deferred,
                    format!("another client has change {} prepared", pending_id),
                )
            });
        }
        if msg.version_number <= state.highest_version {
            return Ok(self.reject(
                &state,
                RejectionReason::BadChange,
                format!(
                    "version {} is not above highest version {}",
                    msg.version_number, state.highest_version
                ),
            ));
        }
        if self.store.get_change(msg.change_uuid)?.is_some() {
            return Ok(self.reject(
                &state,
                RejectionReason::BadChange,
                format!("change {} was already used", msg.change_uuid),
            ));
        }

        let base = self.store.current_committed_config(&state)?;
        let result = match self.applicator.try_apply(base.as_ref(), &msg.change) {
            PotentialApplicationResult::Allowed(result) => result,
            PotentialApplicationResult::Rejected(reason) => {
                return Ok(self.reject(&state, RejectionReason::Unacceptable, reason));
            }
        };

        let record = ChangeRequest {
            uuid: msg.change_uuid,
            state: ChangeRequestState::Prepared,
            version: msg.version_number,
            change: msg.change.clone(),
            result_hash: config_hash(&result)?,
            creation_host: msg.mutation_host.clone(),
            creation_user: msg.mutation_user.clone(),
            creation_timestamp: msg.mutation_timestamp,
            prev_change_uuid: state.latest_change_uuid,
        };
        let change = self
            .store
            .begin(&state)
            .mode(NodeMode::Prepared)
            .last_mutation(&msg.mutation_host, &msg.mutation_user, msg.mutation_timestamp)
            .latest_change(msg.change_uuid)
            .highest_version(msg.version_number)
            .change_request(&record)?;
        self.store.apply(change)?;

        tracing::info!(
            node = %self.node_name,
            change = %msg.change_uuid,
            version = msg.version_number,
            "Prepared: {}",
            msg.change.summary()
        );
        Ok(AcceptRejectResponse::accept())
    }

    /// Look up the change a commit or rollback refers to, or the rejection
    /// that applies.
    fn pending_change(
        &self,
        state: &NodeProtocolState,
        expected: u64,
        uuid: Uuid,
    ) -> Result<std::result::Result<ChangeRequest, AcceptRejectResponse>> {
        if let Some(rejection) = self.fence_rejection(state, expected) {
            return Ok(Err(rejection));
        }
        if state.mode == NodeMode::Accepting {
            return Ok(Err(self.reject(
                state,
                RejectionReason::BadSequence,
                "no change is prepared",
            )));
        }
        if state.latest_change_uuid != Some(uuid) {
            return Ok(Err(self.reject(
                state,
                RejectionReason::UnknownChange,
                format!("change {} is not the prepared change", uuid),
            )));
        }
        let record = self
            .store
            .get_change(uuid)?
            .ok_or_else(|| Error::Corrupted(format!("prepared change {} is missing", uuid)))?;
        Ok(Ok(record))
    }

    pub fn commit(&self, msg: &CommitMessage) -> Result<AcceptRejectResponse> {
        let _guard = self.lock()?;
        let state = self.store.load_state()?;

        if let Some(existing) = self.store.get_change(msg.change_uuid)? {
            if existing.state == ChangeRequestState::Committed {
                tracing::debug!(node = %self.node_name, change = %msg.change_uuid, "Retransmitted commit");
                return Ok(AcceptRejectResponse::accept());
            }
        }
        let mut record = match self.pending_change(
            &state,
            msg.expected_mutative_message_count,
            msg.change_uuid,
        )? {
            Ok(record) => record,
            Err(rejection) => return Ok(rejection),
        };

        let base = self.store.current_committed_config(&state)?;
        let result = match self.applicator.try_apply(base.as_ref(), &record.change) {
            PotentialApplicationResult::Allowed(result) => result,
            PotentialApplicationResult::Rejected(reason) => {
                return Err(Error::ApplyFailed(format!(
                    "prepared change {} no longer applies: {}",
                    record.uuid, reason
                )));
            }
        };
        let actual = config_hash(&result)?;
        if actual != record.result_hash {
            return Err(Error::HashMismatch {
                version: record.version,
                expected: record.result_hash,
                actual,
            });
        }

        record.state = ChangeRequestState::Committed;
        let change = self
            .store
            .begin(&state)
            .mode(NodeMode::Accepting)
            .last_mutation(&msg.mutation_host, &msg.mutation_user, msg.mutation_timestamp)
            .current_version(record.version)
            .change_request(&record)?
            .snapshot(record.version, result.clone());
        self.store.apply(change)?;

        tracing::info!(
            node = %self.node_name,
            change = %record.uuid,
            version = record.version,
            "Committed"
        );
        if let Err(e) = self.applicator.apply(&record.change, &result) {
            tracing::error!(
                node = %self.node_name,
                change = %record.uuid,
                "Committed change failed to take effect: {}",
                e
            );
        }
        self.committed_tx.send_replace(Some(result));
        Ok(AcceptRejectResponse::accept())
    }

    pub fn rollback(&self, msg: &RollbackMessage) -> Result<AcceptRejectResponse> {
        let _guard = self.lock()?;
        let state = self.store.load_state()?;

        if let Some(existing) = self.store.get_change(msg.change_uuid)? {
            if existing.state == ChangeRequestState::RolledBack {
                tracing::debug!(node = %self.node_name, change = %msg.change_uuid, "Retransmitted rollback");
                return Ok(AcceptRejectResponse::accept());
            }
        }
        let mut record = match self.pending_change(
            &state,
            msg.expected_mutative_message_count,
            msg.change_uuid,
        )? {
            Ok(record) => record,
            Err(rejection) => return Ok(rejection),
        };

        record.state = ChangeRequestState::RolledBack;
        let change = self
            .store
            .begin(&state)
            .mode(NodeMode::Accepting)
            .last_mutation(&msg.mutation_host, &msg.mutation_user, msg.mutation_timestamp)
            .change_request(&record)?;
        self.store.apply(change)?;

        tracing::info!(
            node = %self.node_name,
            change = %record.uuid,
            version = record.version,
            "Rolled back"
        );
        Ok(AcceptRejectResponse::accept())
    }

    /// Claim the node for a new operator, rolling back any pending change.
    pub fn takeover(&self, msg: &TakeoverMessage) -> Result<AcceptRejectResponse> {
        let _guard = self.lock()?;
        let state = self.store.load_state()?;

        if let Some(rejection) = self.fence_rejection(&state, msg.expected_mutative_message_count) {
            return Ok(rejection);
        }

        let mut change = self
            .store
            .begin(&state)
            .mode(NodeMode::Accepting)
            .last_mutation(&msg.mutation_host, &msg.mutation_user, msg.mutation_timestamp);

        if state.mode == NodeMode::Prepared {
            if let Some(uuid) = state.latest_change_uuid {
                let mut record = self
                    .store
                    .get_change(uuid)?
                    .ok_or_else(|| Error::Corrupted(format!("prepared change {} is missing", uuid)))?;
                record.state = ChangeRequestState::RolledBack;
                change = change.change_request(&record)?;
                tracing::warn!(
                    node = %self.node_name,
                    change = %uuid,
                    "Takeover rolls back pending change"
                );
            }
        }
        self.store.apply(change)?;

        tracing::info!(
            node = %self.node_name,
            host = %msg.mutation_host,
            user = %msg.mutation_user,
            "Taken over"
        );
        Ok(AcceptRejectResponse::accept())
    }
}
