//! Reconciler trait and plan types.
//!
//! A reconciler diffs a stack's desired graph against the state it observed
//! last time and converges the difference. The graph handed over is always
//! frozen, acyclic and free of unresolved upstream references.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::resource::ResourceKind;
use crate::stack::Stack;
use crate::Result;

/// Values a node produces once applied (cluster endpoint, release status...).
pub type Attributes = BTreeMap<String, Value>;

/// What a reconciler will do to one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
    NoOp,
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeAction::Create => write!(f, "create"),
            ChangeAction::Update => write!(f, "update"),
            ChangeAction::Delete => write!(f, "delete"),
            ChangeAction::NoOp => write!(f, "no-op"),
        }
    }
}

/// A planned change to one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceChange {
    pub node: String,
    pub kind: ResourceKind,
    pub action: ChangeAction,
}

/// Ordered changes for one stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub stack: String,
    pub changes: Vec<ResourceChange>,
}

impl Plan {
    /// Whether applying the plan would touch anything.
    pub fn has_changes(&self) -> bool {
        self.changes.iter().any(|c| c.action != ChangeAction::NoOp)
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for change in &self.changes {
            match change.action {
                ChangeAction::Create => summary.to_add += 1,
                ChangeAction::Update => summary.to_change += 1,
                ChangeAction::Delete => summary.to_destroy += 1,
                ChangeAction::NoOp => summary.unchanged += 1,
            }
        }
        summary
    }
}

/// Change counts of a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub to_add: usize,
    pub to_change: usize,
    pub to_destroy: usize,
    pub unchanged: usize,
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to add, {} to change, {} to destroy, {} unchanged",
            self.to_add, self.to_change, self.to_destroy, self.unchanged
        )
    }
}

/// Result of applying a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Changes actually performed, in order.
    pub applied: Vec<ResourceChange>,
    /// Attributes of every node of the stack after the apply, keyed by node
    /// name, including nodes left untouched.
    pub attributes: BTreeMap<String, Attributes>,
}

/// Trait for reconcilers.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Name of this reconciler.
    fn name(&self) -> &'static str;

    /// Compute the changes needed to converge `stack`.
    async fn plan(&self, stack: &Stack) -> Result<Plan>;

    /// Apply a plan computed for `stack`. Stops at the first node that fails
    /// with [`crate::Error::Reconcile`].
    async fn apply(&self, stack: &Stack, plan: &Plan) -> Result<ApplyReport>;

    /// Delete every resource recorded for the stack named `stack`.
    async fn destroy(&self, stack: &str) -> Result<Vec<ResourceChange>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_summary() {
        let change = |node: &str, action| ResourceChange {
            node: node.to_string(),
            kind: ResourceKind::RawManifest,
            action,
        };
        let plan = Plan {
            stack: "svc".to_string(),
            changes: vec![
                change("deployment", ChangeAction::Create),
                change("service", ChangeAction::NoOp),
                change("ingress", ChangeAction::Update),
                change("old", ChangeAction::Delete),
            ],
        };
        assert!(plan.has_changes());
        let summary = plan.summary();
        assert_eq!(summary.to_add, 1);
        assert_eq!(summary.to_change, 1);
        assert_eq!(summary.to_destroy, 1);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(
            summary.to_string(),
            "1 to add, 1 to change, 1 to destroy, 1 unchanged"
        );
    }

    #[test]
    fn test_noop_plan_has_no_changes() {
        let plan = Plan {
            stack: "svc".to_string(),
            changes: vec![ResourceChange {
                node: "ns".to_string(),
                kind: ResourceKind::Namespace,
                action: ChangeAction::NoOp,
            }],
        };
        assert!(!plan.has_changes());
    }
}
