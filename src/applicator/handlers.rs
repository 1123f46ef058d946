//! Per-kind change handlers and the registry that routes to them

use super::change::{Change, ChangeKind};
use super::model::NodeContext;
use crate::common::utils::parse_duration;
use std::collections::HashMap;
use std::sync::Arc;

/// Validates and derives configuration for one kind of change.
pub trait ChangeHandler: Send + Sync {
    /// Derive the configuration that results from `change` on top of
    /// `base`, or explain why it cannot be applied.
    fn try_apply(
        &self,
        base: Option<&NodeContext>,
        node_name: &str,
        change: &Change,
    ) -> std::result::Result<NodeContext, String>;

    /// Runtime effect of a committed change. Most changes only alter the
    /// stored configuration.
    fn apply(&self, _change: &Change, _committed: &NodeContext) -> crate::Result<()> {
        Ok(())
    }
}

/// Maps a change kind to the handler responsible for it.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<ChangeKind, Arc<dyn ChangeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in handlers for every non-bundle kind.
    pub fn with_defaults() -> Self {
        let settings = Arc::new(SettingHandler::with_default_rules());
        let topology = Arc::new(TopologyHandler);
        let mut registry = Self::new();
        registry.register(ChangeKind::Activate, Arc::new(ActivationHandler));
        registry.register(ChangeKind::SetSetting, settings.clone());
        registry.register(ChangeKind::UnsetSetting, settings);
        registry.register(ChangeKind::AttachNode, topology.clone());
        registry.register(ChangeKind::DetachNode, topology);
        registry
    }

    /// Replace the handler for `kind`.
    pub fn register(&mut self, kind: ChangeKind, handler: Arc<dyn ChangeHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: ChangeKind) -> Option<&Arc<dyn ChangeHandler>> {
        self.handlers.get(&kind)
    }
}

pub struct ActivationHandler;

impl ChangeHandler for ActivationHandler {
    fn try_apply(
        &self,
        base: Option<&NodeContext>,
        node_name: &str,
        change: &Change,
    ) -> std::result::Result<NodeContext, String> {
        let Change::Activate { cluster } = change else {
            return Err(format!("activation handler cannot apply {:?}", change.kind()));
        };
        if base.is_some() {
            return Err("node is already activated".into());
        }
        if cluster.name.trim().is_empty() {
            return Err("cluster name is empty".into());
        }
        if !cluster.contains_node(node_name) {
            return Err(format!(
                "node '{}' is not part of cluster '{}'",
                node_name, cluster.name
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for name in cluster.node_names() {
            if !seen.insert(name) {
                return Err(format!("duplicate node name '{}'", name));
            }
        }
        Ok(NodeContext::new(cluster.clone(), node_name))
    }

    fn apply(&self, _change: &Change, committed: &NodeContext) -> crate::Result<()> {
        tracing::info!(
            cluster = %committed.cluster.name,
            node = %committed.node_name,
            "Node activated"
        );
        Ok(())
    }
}

/// Check applied to the value of one named setting.
pub type SettingRule = Arc<dyn Fn(&str) -> std::result::Result<(), String> + Send + Sync>;

/// Handles set and unset of named settings, with optional per-name rules.
#[derive(Clone, Default)]
pub struct SettingHandler {
    rules: HashMap<String, SettingRule>,
}

impl SettingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_rules() -> Self {
        let mut handler = Self::new();
        handler.add_rule("client-reconnect-window", |v| {
            parse_duration(v).map(|_| ()).map_err(|e| e.to_string())
        });
        handler.add_rule("client-lease-duration", |v| {
            parse_duration(v).map(|_| ()).map_err(|e| e.to_string())
        });
        handler.add_rule("failover-priority", |v| {
            if v == "availability" {
                return Ok(());
            }
            match v.strip_prefix("consistency") {
                Some("") => Ok(()),
                Some(rest) => rest
                    .strip_prefix(':')
                    .and_then(|n| n.parse::<u32>().ok())
                    .map(|_| ())
                    .ok_or_else(|| format!("invalid failover-priority: {}", v)),
                None => Err(format!("invalid failover-priority: {}", v)),
            }
        });
        handler
    }

    pub fn add_rule<F>(&mut self, name: impl Into<String>, rule: F)
    where
        F: Fn(&str) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.rules.insert(name.into(), Arc::new(rule));
    }
}

impl ChangeHandler for SettingHandler {
    fn try_apply(
        &self,
        base: Option<&NodeContext>,
        _node_name: &str,
        change: &Change,
    ) -> std::result::Result<NodeContext, String> {
        let base = base.ok_or("node is not activated")?;
        let mut next = base.clone();
        match change {
            Change::SetSetting {
                applicability,
                name,
                value,
            } => {
                if name.trim().is_empty() {
                    return Err("setting name is empty".into());
                }
                if let Some(rule) = self.rules.get(name) {
                    rule(value)?;
                }
                for settings in scoped_settings(&mut next, applicability)? {
                    settings.insert(name.clone(), value.clone());
                }
            }
            Change::UnsetSetting {
                applicability,
                name,
            } => {
                let mut removed = false;
                for settings in scoped_settings(&mut next, applicability)? {
                    removed |= settings.remove(name).is_some();
                }
                if !removed {
                    return Err(format!("setting '{}' is not set on {}", name, applicability));
                }
            }
            other => {
                return Err(format!("setting handler cannot apply {:?}", other.kind()));
            }
        }
        Ok(next)
    }

    fn apply(&self, change: &Change, committed: &NodeContext) -> crate::Result<()> {
        if let Change::SetSetting { name, .. } | Change::UnsetSetting { name, .. } = change {
            tracing::info!(
                node = %committed.node_name,
                setting = %name,
                value = ?committed.setting(name),
                "Setting changed"
            );
        }
        Ok(())
    }
}

/// Setting maps a change scope writes to.
fn scoped_settings<'a>(
    ctx: &'a mut NodeContext,
    applicability: &super::change::Applicability,
) -> std::result::Result<Vec<&'a mut std::collections::BTreeMap<String, String>>, String> {
    use super::change::Applicability;
    match applicability {
        Applicability::Cluster => Ok(vec![&mut ctx.cluster.settings]),
        Applicability::Stripe { stripe } => {
            let stripe = ctx
                .cluster
                .stripe_mut(stripe)
                .ok_or_else(|| format!("unknown stripe '{}'", stripe))?;
            Ok(stripe.nodes.iter_mut().map(|n| &mut n.settings).collect())
        }
        Applicability::Node { node } => {
            let node = ctx
                .cluster
                .node_mut(node)
                .ok_or_else(|| format!("unknown node '{}'", node))?;
            Ok(vec![&mut node.settings])
        }
    }
}

/// Attaches and detaches nodes.
pub struct TopologyHandler;

impl ChangeHandler for TopologyHandler {
    fn try_apply(
        &self,
        base: Option<&NodeContext>,
        _node_name: &str,
        change: &Change,
    ) -> std::result::Result<NodeContext, String> {
        let base = base.ok_or("node is not activated")?;
        let mut next = base.clone();
        match change {
            Change::AttachNode { stripe, node } => {
                if next.cluster.contains_node(&node.name) {
                    return Err(format!("node '{}' is already in the cluster", node.name));
                }
                let target = next
                    .cluster
                    .stripe_mut(stripe)
                    .ok_or_else(|| format!("unknown stripe '{}'", stripe))?;
                target.nodes.push(node.clone());
            }
            Change::DetachNode { node } => {
                if *node == next.node_name {
                    return Err(format!("node '{}' cannot detach itself", node));
                }
                let stripe = next
                    .cluster
                    .stripes
                    .iter_mut()
                    .find(|s| s.node(node).is_some())
                    .ok_or_else(|| format!("unknown node '{}'", node))?;
                if stripe.nodes.len() == 1 {
                    return Err(format!(
                        "node '{}' is the last node of stripe '{}'",
                        node, stripe.name
                    ));
                }
                stripe.nodes.retain(|n| n.name != *node);
            }
            other => {
                return Err(format!("topology handler cannot apply {:?}", other.kind()));
            }
        }
        Ok(next)
    }

    fn apply(&self, change: &Change, committed: &NodeContext) -> crate::Result<()> {
        tracing::info!(
            node = %committed.node_name,
            nodes = committed.cluster.node_count(),
            "Topology changed: {}",
            change.summary()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applicator::change::Applicability;
    use crate::applicator::model::{Cluster, Node, Stripe};

    fn activated(node: &str) -> NodeContext {
        let cluster = Cluster::new(
            "prod",
            vec![Stripe::new(
                "stripe-1",
                vec![Node::new("n1", "h:1"), Node::new("n2", "h:2")],
            )],
        );
        NodeContext::new(cluster, node)
    }

    #[test]
    fn test_activation() {
        let ctx = activated("n1");
        let change = Change::Activate {
            cluster: ctx.cluster.clone(),
        };
        let result = ActivationHandler.try_apply(None, "n1", &change).unwrap();
        assert_eq!(result, ctx);

        assert!(ActivationHandler.try_apply(Some(&ctx), "n1", &change).is_err());
        assert!(ActivationHandler.try_apply(None, "n9", &change).is_err());
    }

    #[test]
    fn test_setting_rules() {
        let handler = SettingHandler::with_default_rules();
        let ctx = activated("n1");

        let ok = Change::set(Applicability::Cluster, "failover-priority", "consistency:2");
        let next = handler.try_apply(Some(&ctx), "n1", &ok).unwrap();
        assert_eq!(next.setting("failover-priority"), Some("consistency:2"));

        let bad = Change::set(Applicability::Cluster, "failover-priority", "speed");
        assert!(handler.try_apply(Some(&ctx), "n1", &bad).is_err());

        let bad = Change::set(Applicability::Cluster, "client-reconnect-window", "soon");
        assert!(handler.try_apply(Some(&ctx), "n1", &bad).is_err());
    }

    #[test]
    fn test_stripe_scoped_setting() {
        let handler = SettingHandler::new();
        let ctx = activated("n1");
        let change = Change::set(Applicability::stripe("stripe-1"), "log-dir", "/logs");
        let next = handler.try_apply(Some(&ctx), "n1", &change).unwrap();
        assert!(next
            .cluster
            .node_names()
            .all(|n| next.cluster.find_node(n).unwrap().1.settings["log-dir"] == "/logs"));

        let unset = Change::unset(Applicability::node("n2"), "log-dir");
        let next = handler.try_apply(Some(&next), "n1", &unset).unwrap();
        assert!(!next.cluster.find_node("n2").unwrap().1.settings.contains_key("log-dir"));
        assert!(handler.try_apply(Some(&next), "n1", &unset).is_err());
    }

    #[test]
    fn test_topology() {
        let ctx = activated("n1");
        let attach = Change::AttachNode {
            stripe: "stripe-1".into(),
            node: Node::new("n3", "h:3"),
        };
        let next = TopologyHandler.try_apply(Some(&ctx), "n1", &attach).unwrap();
        assert_eq!(next.cluster.node_count(), 3);
        assert!(TopologyHandler.try_apply(Some(&next), "n1", &attach).is_err());

        let detach_self = Change::DetachNode { node: "n1".into() };
        assert!(TopologyHandler.try_apply(Some(&next), "n1", &detach_self).is_err());

        let detach = Change::DetachNode { node: "n3".into() };
        let next = TopologyHandler.try_apply(Some(&next), "n1", &detach).unwrap();
        assert_eq!(next, ctx);
    }

    #[test]
    fn test_registry_override() {
        struct Refuse;
        impl ChangeHandler for Refuse {
            fn try_apply(
                &self,
                _: Option<&NodeContext>,
                _: &str,
                _: &Change,
            ) -> std::result::Result<NodeContext, String> {
                Err("refused".into())
            }
        }

        let mut registry = HandlerRegistry::with_defaults();
        assert!(registry.get(ChangeKind::Bundle).is_none());
        registry.register(ChangeKind::SetSetting, Arc::new(Refuse));
        let handler = registry.get(ChangeKind::SetSetting).unwrap();
        let change = Change::set(Applicability::Cluster, "x", "y");
        assert_eq!(
            handler.try_apply(Some(&activated("n1")), "n1", &change),
            Err("refused".to_string())
        );
    }
}
