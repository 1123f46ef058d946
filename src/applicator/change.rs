//! Change values and their scope

use super::model::{Cluster, Node, NodeContext};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which nodes a change element takes effect on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Applicability {
    Cluster,
    Stripe { stripe: String },
    Node { node: String },
}

impl Applicability {
    pub fn stripe(stripe: impl Into<String>) -> Self {
        Applicability::Stripe {
            stripe: stripe.into(),
        }
    }

    pub fn node(node: impl Into<String>) -> Self {
        Applicability::Node { node: node.into() }
    }

    pub fn applies_to(&self, ctx: &NodeContext) -> bool {
        match self {
            Applicability::Cluster => true,
            Applicability::Stripe { stripe } => ctx.stripe_name() == Some(stripe.as_str()),
            Applicability::Node { node } => ctx.node_name == *node,
        }
    }
}

impl fmt::Display for Applicability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Applicability::Cluster => write!(f, "cluster"),
            Applicability::Stripe { stripe } => write!(f, "stripe:{}", stripe),
            Applicability::Node { node } => write!(f, "node:{}", node),
        }
    }
}

/// Discriminator used to route a change to its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Activate,
    SetSetting,
    UnsetSetting,
    AttachNode,
    DetachNode,
    Bundle,
}

/// A configuration change. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    /// First configuration of a node.
    Activate { cluster: Cluster },
    SetSetting {
        applicability: Applicability,
        name: String,
        value: String,
    },
    UnsetSetting {
        applicability: Applicability,
        name: String,
    },
    AttachNode { stripe: String, node: Node },
    DetachNode { node: String },
    /// Ordered elements applied as one unit.
    Bundle { changes: Vec<Change> },
}

impl Change {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::Activate { .. } => ChangeKind::Activate,
            Change::SetSetting { .. } => ChangeKind::SetSetting,
            Change::UnsetSetting { .. } => ChangeKind::UnsetSetting,
            Change::AttachNode { .. } => ChangeKind::AttachNode,
            Change::DetachNode { .. } => ChangeKind::DetachNode,
            Change::Bundle { .. } => ChangeKind::Bundle,
        }
    }

    pub fn applicability(&self) -> Applicability {
        match self {
            Change::SetSetting { applicability, .. }
            | Change::UnsetSetting { applicability, .. } => applicability.clone(),
            _ => Applicability::Cluster,
        }
    }

    pub fn set(applicability: Applicability, name: impl Into<String>, value: impl Into<String>) -> Self {
        Change::SetSetting {
            applicability,
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn unset(applicability: Applicability, name: impl Into<String>) -> Self {
        Change::UnsetSetting {
            applicability,
            name: name.into(),
        }
    }

    pub fn bundle(changes: Vec<Change>) -> Self {
        Change::Bundle { changes }
    }

    /// Operator-facing one-line summary.
    pub fn summary(&self) -> String {
        match self {
            Change::Activate { cluster } => format!(
                "activate cluster '{}' with {} node(s)",
                cluster.name,
                cluster.node_count()
            ),
            Change::SetSetting {
                applicability,
                name,
                value,
            } => format!("set {}={} on {}", name, value, applicability),
            Change::UnsetSetting {
                applicability,
                name,
            } => format!("unset {} on {}", name, applicability),
            Change::AttachNode { stripe, node } => {
                format!("attach node '{}' to stripe '{}'", node.name, stripe)
            }
            Change::DetachNode { node } => format!("detach node '{}'", node),
            Change::Bundle { changes } => {
                let parts: Vec<_> = changes.iter().map(Change::summary).collect();
                format!("[{}]", parts.join("; "))
            }
        }
    }
}
