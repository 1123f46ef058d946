//! Common utilities and types shared across dynconf

pub mod config;
pub mod error;
pub mod hash;
pub mod messages;
pub mod storage;
pub mod utils;

pub use config::{Config, LedgerBackend, NodeConfig, OrchestratorConfig};
pub use error::{Error, Result};
pub use hash::{blake3_hash, config_hash};
pub use messages::{
    AcceptRejectResponse, ChangeDetails, ChangeRequestState, CommitMessage, DiscoverResponse,
    NodeMode, PrepareMessage, RejectionReason, RollbackMessage, TakeoverMessage,
};
pub use storage::{open_ledger, Ledger, LedgerOp, MemLedger, RocksLedger};
pub use utils::{decode_key, encode_key, parse_duration, ChangeIdGenerator, Environment};
