//! # dynconf
//!
//! Consistent configuration changes across a multi-node cluster:
//! - A client-driven two-phase commit, no coordinator process
//! - Durable per-node protocol state and versioned config snapshots
//! - Fencing with a mutative message count, so concurrent operators never
//!   both succeed
//! - Repair of half-finished changes and takeover of abandoned nodes
//!
//! ## Architecture
//!
//! ```text
//!             ┌──────────────────────────┐
//!             │       Orchestrator       │
//!             │ discover → prepare →     │
//!             │ commit | rollback        │
//!             └───────────┬──────────────┘
//!                         │ HTTP/JSON
//!   ┌─────────────────────┼──────────────────────┐
//!   │                     │                      │
//! ┌─▼────────────┐  ┌─────▼────────┐   ┌─────────▼────┐
//! │ Node 1       │  │ Node 2       │   │ Node 3       │
//! │ + ledger     │  │ + ledger     │   │ + ledger     │
//! │ + snapshots  │  │ + snapshots  │   │ + snapshots  │
//! └──────────────┘  └──────────────┘   └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a node
//! ```bash
//! dynconf-node --name node-1 --bind 0.0.0.0:9410 --data-dir ./node-1
//! ```
//!
//! ### Use the CLI
//! ```bash
//! # Activate a cluster described in JSON
//! dynconf --endpoints n1:9410,n2:9410 activate --file cluster.json
//!
//! # Change a setting everywhere
//! dynconf --endpoints n1:9410,n2:9410 set client-lease-duration 20s
//!
//! # Inspect and recover
//! dynconf --endpoints n1:9410,n2:9410 status
//! dynconf --endpoints n1:9410,n2:9410 repair --force rollback
//! dynconf verify --name node-1 --data-dir ./node-1
//! ```

pub mod applicator;
pub mod common;
pub mod node;
pub mod ops;
pub mod orchestrator;

// Re-export commonly used types
pub use applicator::{Change, Cluster, Node, NodeContext, Stripe};
pub use common::{Config, Error, Result};
pub use node::{NodeServer, ProtocolServer};
pub use orchestrator::{Consistency, Orchestrator};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
