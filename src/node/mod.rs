//! Node side of the change protocol
//!
//! Each cluster node runs a [`ProtocolServer`] over its own durable state
//! and exposes it over HTTP.

pub mod http;
pub mod protocol;
pub mod server;
pub mod snapshot;
pub mod state;

pub use protocol::ProtocolServer;
pub use server::NodeServer;
pub use snapshot::{FileSnapshotStore, MemSnapshotStore, SnapshotFilename, SnapshotStorage};
pub use state::{ChangeRequest, NodeProtocolState, NodeStateStore};
