//! Change applicator
//!
//! Turns a [`Change`] plus a node's current configuration into the next
//! configuration, or rejects it. Bundles are folded element by element and
//! either every element applies or the whole bundle is rejected. Elements
//! whose [`Applicability`] excludes this node are skipped.

pub mod change;
pub mod handlers;
pub mod model;

pub use change::{Applicability, Change, ChangeKind};
pub use handlers::{
    ActivationHandler, ChangeHandler, HandlerRegistry, SettingHandler, SettingRule,
    TopologyHandler,
};
pub use model::{Cluster, Node, NodeContext, Stripe};

use crate::Result;

/// Outcome of validating a change against a base configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PotentialApplicationResult {
    Allowed(NodeContext),
    Rejected(String),
}

impl PotentialApplicationResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PotentialApplicationResult::Allowed(_))
    }
}

pub trait ChangeApplicator: Send + Sync {
    /// Validate `change` against `base` (None before activation) and derive
    /// the resulting configuration. Must not have side effects.
    fn try_apply(&self, base: Option<&NodeContext>, change: &Change) -> PotentialApplicationResult;

    /// Run the runtime effects of a change that was committed with the
    /// configuration `committed`.
    fn apply(&self, change: &Change, committed: &NodeContext) -> Result<()>;
}

/// Applicator that routes every element to the handler registered for its
/// kind.
#[derive(Clone)]
pub struct RoutingApplicator {
    node_name: String,
    registry: HandlerRegistry,
}

impl RoutingApplicator {
    pub fn new(node_name: impl Into<String>, registry: HandlerRegistry) -> Self {
        Self {
            node_name: node_name.into(),
            registry,
        }
    }

    pub fn with_defaults(node_name: impl Into<String>) -> Self {
        Self::new(node_name, HandlerRegistry::with_defaults())
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    fn fold(
        &self,
        base: Option<NodeContext>,
        change: &Change,
    ) -> std::result::Result<Option<NodeContext>, String> {
        match change {
            Change::Bundle { changes } => {
                if changes.is_empty() {
                    return Err("empty change bundle".into());
                }
                let mut current = base;
                for element in changes {
                    current = self.fold(current, element)?;
                }
                Ok(current)
            }
            element => {
                let skip = match &base {
                    Some(ctx) => !element.applicability().applies_to(ctx),
                    None if !matches!(element, Change::Activate { .. }) => {
                        return Err(format!(
                            "node '{}' is not activated; cannot {}",
                            self.node_name,
                            element.summary()
                        ));
                    }
                    None => false,
                };
                if skip {
                    return Ok(base);
                }
                let handler = self
                    .registry
                    .get(element.kind())
                    .ok_or_else(|| format!("no handler for {:?} changes", element.kind()))?;
                handler
                    .try_apply(base.as_ref(), &self.node_name, element)
                    .map(Some)
            }
        }
    }

    fn apply_element(&self, change: &Change, committed: &NodeContext) -> Result<()> {
        match change {
            Change::Bundle { changes } => {
                for element in changes {
                    self.apply_element(element, committed)?;
                }
                Ok(())
            }
            element if element.applicability().applies_to(committed) => {
                let handler = self.registry.get(element.kind()).ok_or_else(|| {
                    crate::Error::ApplyFailed(format!("no handler for {:?}", element.kind()))
                })?;
                handler.apply(element, committed)
            }
            _ => Ok(()),
        }
    }
}

impl ChangeApplicator for RoutingApplicator {
    fn try_apply(&self, base: Option<&NodeContext>, change: &Change) -> PotentialApplicationResult {
        match self.fold(base.cloned(), change) {
            Ok(Some(next)) => PotentialApplicationResult::Allowed(next),
            Ok(None) => PotentialApplicationResult::Rejected(format!(
                "change produced no configuration for node '{}'",
                self.node_name
            )),
            Err(reason) => PotentialApplicationResult::Rejected(reason),
        }
    }

    fn apply(&self, change: &Change, committed: &NodeContext) -> Result<()> {
        self.apply_element(change, committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> Cluster {
        Cluster::new(
            "prod",
            vec![
                Stripe::new("s1", vec![Node::new("n1", "h:1")]),
                Stripe::new("s2", vec![Node::new("n2", "h:2")]),
            ],
        )
    }

    fn activated(node: &str) -> NodeContext {
        NodeContext::new(cluster(), node)
    }

    #[test]
    fn test_requires_activation_first() {
        let applicator = RoutingApplicator::with_defaults("n1");
        let set = Change::set(Applicability::Cluster, "a", "b");
        assert!(!applicator.try_apply(None, &set).is_allowed());

        let activate = Change::Activate { cluster: cluster() };
        assert_eq!(
            applicator.try_apply(None, &activate),
            PotentialApplicationResult::Allowed(activated("n1"))
        );
    }

    #[test]
    fn test_bundle_is_atomic() {
        let applicator = RoutingApplicator::with_defaults("n1");
        let base = activated("n1");
        let bundle = Change::bundle(vec![
            Change::set(Applicability::Cluster, "log-dir", "/logs"),
            Change::set(Applicability::Cluster, "failover-priority", "bogus"),
        ]);
        match applicator.try_apply(Some(&base), &bundle) {
            PotentialApplicationResult::Rejected(reason) => {
                assert!(reason.contains("failover-priority"))
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert!(!applicator
            .try_apply(Some(&base), &Change::bundle(vec![]))
            .is_allowed());
    }

    #[test]
    fn test_activate_then_set_in_one_bundle() {
        let applicator = RoutingApplicator::with_defaults("n2");
        let bundle = Change::bundle(vec![
            Change::Activate { cluster: cluster() },
            Change::set(Applicability::Cluster, "failover-priority", "availability"),
        ]);
        let PotentialApplicationResult::Allowed(ctx) = applicator.try_apply(None, &bundle) else {
            panic!("bundle should apply");
        };
        assert_eq!(ctx.setting("failover-priority"), Some("availability"));
    }

    #[test]
    fn test_inapplicable_elements_are_skipped() {
        let applicator = RoutingApplicator::with_defaults("n1");
        let base = activated("n1");
        let bundle = Change::bundle(vec![
            Change::set(Applicability::node("n2"), "log-dir", "/n2"),
            Change::set(Applicability::stripe("s1"), "log-dir", "/s1"),
        ]);
        let PotentialApplicationResult::Allowed(ctx) = applicator.try_apply(Some(&base), &bundle)
        else {
            panic!("bundle should apply");
        };
        assert_eq!(ctx.setting("log-dir"), Some("/s1"));
        assert!(ctx.cluster.find_node("n2").unwrap().1.settings.is_empty());
        assert!(applicator.apply(&bundle, &ctx).is_ok());
    }
}
