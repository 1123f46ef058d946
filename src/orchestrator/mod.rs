//! Cluster-side driver of the change protocol
//!
//! The orchestrator discovers every node, decides whether a change can be
//! attempted, and walks the nodes through prepare and then commit or
//! rollback. It also repairs changes left half-done and takes over nodes
//! held by a vanished operator.

pub mod analyzer;
pub mod endpoint;
pub mod process;
pub mod receiver;

pub use analyzer::{analyze_global_state, Consistency, GlobalState};
pub use endpoint::{HttpEndpoint, LocalEndpoint, NodeEndpoint};
pub use process::{
    AbandonToken, EndpointOutcome, EndpointStatus, Orchestrator, Phase, RepairAction, RunOutcome,
    RunReport, StatusReport,
};
pub use receiver::{LoggingReceiver, MultiReceiver, NoopReceiver, ResultReceiver};
