//! Cluster configuration model
//!
//! A node's configuration is the whole cluster topology as that node sees
//! it, plus the name it runs under.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl Node {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            settings: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stripe {
    pub name: String,
    pub nodes: Vec<Node>,
}

impl Stripe {
    pub fn new(name: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            name: name.into(),
            nodes,
        }
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    pub stripes: Vec<Stripe>,
}

impl Cluster {
    pub fn new(name: impl Into<String>, stripes: Vec<Stripe>) -> Self {
        Self {
            name: name.into(),
            settings: BTreeMap::new(),
            stripes,
        }
    }

    pub fn stripe(&self, name: &str) -> Option<&Stripe> {
        self.stripes.iter().find(|s| s.name == name)
    }

    pub fn stripe_mut(&mut self, name: &str) -> Option<&mut Stripe> {
        self.stripes.iter_mut().find(|s| s.name == name)
    }

    /// The stripe holding `node` and the node itself.
    pub fn find_node(&self, node: &str) -> Option<(&Stripe, &Node)> {
        self.stripes
            .iter()
            .find_map(|s| s.node(node).map(|n| (s, n)))
    }

    pub fn node_mut(&mut self, node: &str) -> Option<&mut Node> {
        self.stripes
            .iter_mut()
            .flat_map(|s| s.nodes.iter_mut())
            .find(|n| n.name == node)
    }

    pub fn contains_node(&self, node: &str) -> bool {
        self.find_node(node).is_some()
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.stripes
            .iter()
            .flat_map(|s| s.nodes.iter().map(|n| n.name.as_str()))
    }

    pub fn node_count(&self) -> usize {
        self.stripes.iter().map(|s| s.nodes.len()).sum()
    }
}

/// Configuration value owned by one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeContext {
    pub cluster: Cluster,
    pub node_name: String,
}

impl NodeContext {
    pub fn new(cluster: Cluster, node_name: impl Into<String>) -> Self {
        Self {
            cluster,
            node_name: node_name.into(),
        }
    }

    pub fn node(&self) -> Option<&Node> {
        self.cluster.find_node(&self.node_name).map(|(_, n)| n)
    }

    pub fn stripe_name(&self) -> Option<&str> {
        self.cluster
            .find_node(&self.node_name)
            .map(|(s, _)| s.name.as_str())
    }

    /// Effective value of a setting for this node: node scope first, then
    /// cluster scope.
    pub fn setting(&self, name: &str) -> Option<&str> {
        self.node()
            .and_then(|n| n.settings.get(name))
            .or_else(|| self.cluster.settings.get(name))
            .map(String::as_str)
    }
}
