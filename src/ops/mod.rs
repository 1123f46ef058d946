//! Ops commands for cluster management

pub mod repair;
pub mod verify;

pub use repair::{repair_cluster, takeover_cluster};
pub use verify::{verify_node, verify_store, VerifyReport};
