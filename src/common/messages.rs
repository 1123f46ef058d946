//! Protocol messages exchanged between the orchestrator and each node

use crate::applicator::{Change, NodeContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Whether a node has a change outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeMode {
    Accepting,
    Prepared,
}

impl fmt::Display for NodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeMode::Accepting => write!(f, "ACCEPTING"),
            NodeMode::Prepared => write!(f, "PREPARED"),
        }
    }
}

impl std::str::FromStr for NodeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACCEPTING" => Ok(NodeMode::Accepting),
            "PREPARED" => Ok(NodeMode::Prepared),
            other => Err(format!("unknown node mode: {}", other)),
        }
    }
}

/// Lifecycle of one change request at one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeRequestState {
    Prepared,
    Committed,
    RolledBack,
}

impl fmt::Display for ChangeRequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeRequestState::Prepared => write!(f, "PREPARED"),
            ChangeRequestState::Committed => write!(f, "COMMITTED"),
            ChangeRequestState::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}

/// Why a node refused a mutating request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionReason {
    /// The change applicator refused the change.
    Unacceptable,
    /// Another operator's change is pending on the node.
    Deferred,
    /// The same operator already has a different change pending.
    AlreadyPrepared,
    /// The expected mutative message count is stale.
    ConcurrentChange,
    /// Commit or rollback for a change the node is not prepared for.
    UnknownChange,
    /// Malformed request: stale version number or reused change uuid.
    BadChange,
    /// Commit or rollback while no change is outstanding.
    BadSequence,
}

impl RejectionReason {
    /// Rejections caused by someone else mutating the node.
    pub fn is_other_client(&self) -> bool {
        matches!(
            self,
            RejectionReason::ConcurrentChange
                | RejectionReason::Deferred
                | RejectionReason::AlreadyPrepared
        )
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectionReason::Unacceptable => "UNACCEPTABLE",
            RejectionReason::Deferred => "DEFERRED",
            RejectionReason::AlreadyPrepared => "ALREADY_PREPARED",
            RejectionReason::ConcurrentChange => "CONCURRENT_CHANGE",
            RejectionReason::UnknownChange => "UNKNOWN_CHANGE",
            RejectionReason::BadChange => "BAD_CHANGE",
            RejectionReason::BadSequence => "BAD_SEQUENCE",
        };
        write!(f, "{}", s)
    }
}

/// Details of one change request as reported by discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDetails {
    pub uuid: Uuid,
    pub state: ChangeRequestState,
    pub version: u64,
    pub change: Change,
    /// Configuration produced by the change, present once committed.
    pub result: Option<NodeContext>,
    pub result_hash: String,
    pub creation_host: String,
    pub creation_user: String,
    pub creation_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverResponse {
    pub mode: NodeMode,
    pub mutative_message_count: u64,
    pub last_mutation_host: Option<String>,
    pub last_mutation_user: Option<String>,
    pub last_mutation_timestamp: Option<DateTime<Utc>>,
    pub current_version: u64,
    pub highest_version: u64,
    pub latest_change: Option<ChangeDetails>,
    pub latest_committed_change: Option<ChangeDetails>,
}

impl DiscoverResponse {
    pub fn latest_change_uuid(&self) -> Option<Uuid> {
        self.latest_change.as_ref().map(|c| c.uuid)
    }

    pub fn latest_change_state(&self) -> Option<ChangeRequestState> {
        self.latest_change.as_ref().map(|c| c.state)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareMessage {
    pub expected_mutative_message_count: u64,
    pub mutation_host: String,
    pub mutation_user: String,
    pub mutation_timestamp: DateTime<Utc>,
    pub change_uuid: Uuid,
    pub version_number: u64,
    pub change: Change,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitMessage {
    pub expected_mutative_message_count: u64,
    pub mutation_host: String,
    pub mutation_user: String,
    pub mutation_timestamp: DateTime<Utc>,
    pub change_uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackMessage {
    pub expected_mutative_message_count: u64,
    pub mutation_host: String,
    pub mutation_user: String,
    pub mutation_timestamp: DateTime<Utc>,
    pub change_uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TakeoverMessage {
    pub expected_mutative_message_count: u64,
    pub mutation_host: String,
    pub mutation_user: String,
    pub mutation_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptRejectResponse {
    pub accepted: bool,
    pub rejection_reason: Option<RejectionReason>,
    pub rejection_message: Option<String>,
    pub last_mutation_host: Option<String>,
    pub last_mutation_user: Option<String>,
}

impl AcceptRejectResponse {
    pub fn accept() -> Self {
        Self {
            accepted: true,
            rejection_reason: None,
            rejection_message: None,
            last_mutation_host: None,
            last_mutation_user: None,
        }
    }

    pub fn reject(
        reason: RejectionReason,
        message: impl Into<String>,
        last_mutation_host: Option<String>,
        last_mutation_user: Option<String>,
    ) -> Self {
        Self {
            accepted: false,
            rejection_reason: Some(reason),
            rejection_message: Some(message.into()),
            last_mutation_host,
            last_mutation_user,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }
}
