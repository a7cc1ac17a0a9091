//! Reconciler that converges stacks through per-kind drivers and a state
//! store.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use kubestack_core::{
    ApplyReport, Attributes, ChangeAction, Error, OutputStore, Plan, Reconciler, ResourceChange,
    ResourceConfig, ResourceKind, ResourceNode, Result, Stack, StackOutputs, StackSet,
};

use crate::driver::{DriverContext, DriverSet, ResourceDriver};
use crate::error::DriverError;
use crate::state::{StackState, StateStore};

/// Diffs stacks against recorded state and applies the difference with the
/// driver registered for each kind.
pub struct DriverReconciler {
    store: Arc<dyn StateStore>,
    drivers: DriverSet,
}

impl DriverReconciler {
    pub fn new(store: Arc<dyn StateStore>, drivers: DriverSet) -> Self {
        Self { store, drivers }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    fn driver(&self, node: &str, kind: ResourceKind) -> Result<&Arc<dyn ResourceDriver>> {
        self.drivers.get(kind).ok_or_else(|| Error::Reconcile {
            node: node.to_string(),
            kind,
            message: format!("no driver registered for {}", kind),
        })
    }

    /// Outputs of `stack` as of its last recorded apply. `None` when the
    /// stack has no state or its state lacks an exported attribute.
    pub async fn recorded_outputs(&self, stack: &Stack) -> Result<Option<StackOutputs>> {
        let Some(state) = self.store.load(stack.name()).await? else {
            return Ok(None);
        };
        Ok(stack.collect_outputs(&state.attributes()).ok())
    }

    /// Plan `target` and its upstream stacks without applying anything.
    ///
    /// Upstream bindings are filled from the outputs recorded for the
    /// producing stacks, so a converged stack plans as unchanged. A stack
    /// whose upstream outputs are not recorded yet is planned by declaration.
    pub async fn plan_unit(&self, stacks: &StackSet, target: &str) -> Result<Vec<Plan>> {
        let mut outputs = OutputStore::new();
        let mut plans = Vec::new();
        for stack in stacks.deploy_order(target)? {
            let plan = match stack.resolve(&outputs) {
                Ok(resolved) => self.plan(&resolved).await?,
                Err(Error::DanglingReference { stack: upstream, output, .. }) => {
                    debug!(
                        stack = %stack.name(),
                        upstream = %upstream,
                        output = %output,
                        "Upstream output not recorded, planning by declaration"
                    );
                    self.plan(stack).await?
                }
                Err(e) => return Err(e),
            };
            if let Some(recorded) = self.recorded_outputs(stack).await? {
                outputs.insert(stack.name(), recorded);
            }
            plans.push(plan);
        }
        Ok(plans)
    }

    async fn load_or_new(&self, stack: &Stack) -> Result<StackState> {
        let state = self.store.load(stack.name()).await?;
        Ok(state.unwrap_or_else(|| {
            StackState::new(stack.name(), stack.graph().environment().clone())
        }))
    }
}

fn reconcile_error(node: &str, kind: ResourceKind, e: DriverError) -> Error {
    Error::Reconcile {
        node: node.to_string(),
        kind,
        message: e.to_string(),
    }
}

fn context(state: &StackState) -> DriverContext {
    DriverContext {
        stack: state.stack.clone(),
        environment: state.environment.clone(),
        tags: state.tags.clone(),
    }
}

/// Action needed to bring `node` from its recorded state to the declared one.
///
/// A node whose declaration is unchanged is still updated when the values it
/// binds have moved since the last apply.
fn node_action(
    stack: &Stack,
    node: &ResourceNode,
    state: &StackState,
    attributes: &BTreeMap<String, Attributes>,
) -> Result<ChangeAction> {
    let Some(recorded) = state.resources.get(node.name()) else {
        return Ok(ChangeAction::Create);
    };
    if recorded.kind != node.kind() || recorded.fingerprint != stack.graph().fingerprint(node.id())? {
        return Ok(ChangeAction::Update);
    }
    match stack.graph().resolve_node(node.id(), attributes) {
        Ok(config) if config != recorded.config => Ok(ChangeAction::Update),
        _ => Ok(ChangeAction::NoOp),
    }
}

#[async_trait]
impl Reconciler for DriverReconciler {
    fn name(&self) -> &'static str {
        "driver"
    }

    async fn plan(&self, stack: &Stack) -> Result<Plan> {
        let state = self.load_or_new(stack).await?;
        let attributes = state.attributes();
        let graph = stack.graph();

        let mut changes = Vec::with_capacity(graph.len());
        for id in graph.topological_order() {
            let node = graph
                .node(id)
                .ok_or_else(|| Error::UnknownNode(id.to_string()))?;
            changes.push(ResourceChange {
                node: node.name().to_string(),
                kind: node.kind(),
                action: node_action(stack, node, &state, &attributes)?,
            });
        }
        for (name, recorded) in state.reverse_apply_order() {
            if graph.node_by_name(name).is_none() {
                changes.push(ResourceChange {
                    node: name.to_string(),
                    kind: recorded.kind,
                    action: ChangeAction::Delete,
                });
            }
        }

        let plan = Plan {
            stack: stack.name().to_string(),
            changes,
        };
        info!(stack = %stack.name(), summary = %plan.summary(), "Planned");
        Ok(plan)
    }

    async fn apply(&self, stack: &Stack, plan: &Plan) -> Result<ApplyReport> {
        if plan.stack != stack.name() {
            return Err(Error::Internal(format!(
                "plan for '{}' applied to stack '{}'",
                plan.stack,
                stack.name()
            )));
        }
        let graph = stack.graph();
        let mut state = self.load_or_new(stack).await?;
        state.tags = stack.tags().clone();
        let ctx = context(&state);
        let mut attributes = state.attributes();
        let mut applied = Vec::new();

        for change in &plan.changes {
            if change.action == ChangeAction::Delete {
                let Some(recorded) = state.resources.get(&change.node).cloned() else {
                    debug!(stack = %ctx.stack, node = %change.node, "Already deleted");
                    continue;
                };
                self.driver(&change.node, recorded.kind)?
                    .delete(&ctx, &change.node, &recorded.config, &recorded.attributes)
                    .await
                    .map_err(|e| reconcile_error(&change.node, recorded.kind, e))?;
                state.forget(&change.node);
                attributes.remove(&change.node);
                self.store.save(&state).await?;
                info!(stack = %ctx.stack, node = %change.node, kind = %recorded.kind, "Deleted");
                applied.push(change.clone());
                continue;
            }

            let node = graph
                .node_by_name(&change.node)
                .ok_or_else(|| Error::UnknownNode(change.node.clone()))?;
            let kind = node.kind();
            let config: ResourceConfig = graph.resolve_node(node.id(), &attributes)?;
            let fingerprint = graph.fingerprint(node.id())?;

            let action = match (change.action, state.resources.get(node.name())) {
                (ChangeAction::NoOp, Some(recorded))
                    if recorded.kind == kind
                        && recorded.fingerprint == fingerprint
                        && recorded.config == config =>
                {
                    continue;
                }
                (_, None) => ChangeAction::Create,
                (_, Some(_)) => ChangeAction::Update,
            };

            let replaced = state
                .resources
                .get(node.name())
                .filter(|recorded| recorded.kind != kind)
                .cloned();
            if let Some(recorded) = replaced {
                warn!(
                    stack = %ctx.stack,
                    node = %node.name(),
                    from = %recorded.kind,
                    to = %kind,
                    "Kind changed, deleting the previous resource"
                );
                self.driver(node.name(), recorded.kind)?
                    .delete(&ctx, node.name(), &recorded.config, &recorded.attributes)
                    .await
                    .map_err(|e| reconcile_error(node.name(), recorded.kind, e))?;
                state.forget(node.name());
                attributes.remove(node.name());
                self.store.save(&state).await?;
            }

            debug!(stack = %ctx.stack, node = %node.name(), %action, "Applying node");
            let produced = self
                .driver(node.name(), kind)?
                .apply(&ctx, node.name(), &config)
                .await
                .map_err(|e| reconcile_error(node.name(), kind, e))?;

            state.record(node.name(), kind, fingerprint, config, produced.clone());
            attributes.insert(node.name().to_string(), produced);
            self.store.save(&state).await?;
            info!(stack = %ctx.stack, node = %node.name(), %kind, %action, "Applied");
            applied.push(ResourceChange {
                node: node.name().to_string(),
                kind,
                action,
            });
        }

        let declared: HashSet<&str> = graph.nodes().map(ResourceNode::name).collect();
        attributes.retain(|name, _| declared.contains(name.as_str()));
        Ok(ApplyReport {
            applied,
            attributes,
        })
    }

    async fn destroy(&self, stack: &str) -> Result<Vec<ResourceChange>> {
        let Some(mut state) = self.store.load(stack).await? else {
            info!(stack = %stack, "No recorded state, nothing to destroy");
            return Ok(Vec::new());
        };
        let ctx = context(&state);
        let order: Vec<(String, ResourceKind)> = state
            .reverse_apply_order()
            .into_iter()
            .map(|(name, recorded)| (name.to_string(), recorded.kind))
            .collect();

        let mut deleted = Vec::with_capacity(order.len());
        for (name, kind) in order {
            let Some(recorded) = state.resources.get(&name).cloned() else {
                continue;
            };
            self.driver(&name, kind)?
                .delete(&ctx, &name, &recorded.config, &recorded.attributes)
                .await
                .map_err(|e| reconcile_error(&name, kind, e))?;
            state.forget(&name);
            self.store.save(&state).await?;
            info!(stack = %stack, node = %name, %kind, "Deleted");
            deleted.push(ResourceChange {
                node: name,
                kind,
                action: ChangeAction::Delete,
            });
        }

        self.store.remove(stack).await?;
        info!(stack = %stack, deleted = deleted.len(), "Destroyed");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DryRunDriver;
    use crate::state::MemoryStateStore;
    use kubestack_core::resource::{
        DnsRecordConfig, NamespaceConfig, RawManifestConfig, RecordType, ServiceAccountConfig,
    };
    use kubestack_core::{Environment, StackBuilder};
    use serde_json::json;

    fn env() -> Environment {
        Environment::new("532673134317", "eu-west-1").unwrap()
    }

    fn namespace(name: &str) -> ResourceConfig {
        ResourceConfig::Namespace(NamespaceConfig {
            name: name.to_string(),
            labels: Default::default(),
        })
    }

    fn service_account(name: &str) -> ResourceConfig {
        ResourceConfig::ServiceAccount(ServiceAccountConfig {
            name: name.to_string(),
            namespace: "apps".to_string(),
            labels: Default::default(),
            annotations: Default::default(),
        })
    }

    fn ingress() -> ResourceConfig {
        ResourceConfig::RawManifest(RawManifestConfig {
            body: json!({
                "apiVersion": "networking.k8s.io/v1",
                "kind": "Ingress",
                "metadata": {"name": "fastapi-ingress", "namespace": "apps"}
            }),
        })
    }

    fn record() -> ResourceConfig {
        ResourceConfig::DnsRecord(DnsRecordConfig {
            zone: "piercuta.com".to_string(),
            record_name: "my-fastapi".to_string(),
            record_type: RecordType::Cname,
            target: None,
            ttl_seconds: 300,
        })
    }

    /// Namespace, service account and optionally an ingress whose hostname
    /// feeds a DNS record.
    fn service_stack(with_dns: bool, sa_name: &str) -> Stack {
        let mut builder = StackBuilder::new("FastApiService", env());
        builder.tag("project", "fastapi-eks");
        let graph = builder.graph_mut();
        let ns = graph
            .add_node(ResourceKind::Namespace, "Apps", namespace("apps"))
            .unwrap();
        let sa = graph
            .add_node(ResourceKind::ServiceAccount, "Runner", service_account(sa_name))
            .unwrap();
        graph.add_dependency(sa, ns).unwrap();
        if with_dns {
            let ing = graph
                .add_node(ResourceKind::RawManifest, "Ingress", ingress())
                .unwrap();
            graph.add_dependency(ing, ns).unwrap();
            let dns = graph
                .add_node(ResourceKind::DnsRecord, "Record", record())
                .unwrap();
            graph
                .bind_attribute(dns, "/target", ing, "load_balancer_hostname")
                .unwrap();
        }
        builder.build().unwrap()
    }

    fn reconciler(driver: Arc<DryRunDriver>) -> DriverReconciler {
        DriverReconciler::new(Arc::new(MemoryStateStore::new()), DriverSet::dry_run(driver))
    }

    fn actions(plan: &Plan) -> Vec<(String, ChangeAction)> {
        plan.changes
            .iter()
            .map(|c| (c.node.clone(), c.action))
            .collect()
    }

    #[tokio::test]
    async fn test_second_apply_is_a_noop() {
        let driver = Arc::new(DryRunDriver::new());
        let reconciler = reconciler(driver.clone());
        let stack = service_stack(true, "runner");

        let plan = reconciler.plan(&stack).await.unwrap();
        assert_eq!(plan.summary().to_add, 4);
        let report = reconciler.apply(&stack, &plan).await.unwrap();
        assert_eq!(report.applied.len(), 4);
        assert_eq!(report.attributes.len(), 4);

        let again = reconciler.plan(&stack).await.unwrap();
        assert!(!again.has_changes());
        let report = reconciler.apply(&stack, &again).await.unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.attributes.len(), 4);
        assert_eq!(driver.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_binding_is_filled_from_applied_attributes() {
        let driver = Arc::new(DryRunDriver::new());
        let reconciler = reconciler(driver);
        let stack = service_stack(true, "runner");
        let plan = reconciler.plan(&stack).await.unwrap();
        let report = reconciler.apply(&stack, &plan).await.unwrap();

        let hostname = &report.attributes["Ingress"]["load_balancer_hostname"];
        assert_eq!(&report.attributes["Record"]["target"], hostname);

        let state = reconciler.store().load("FastApiService").await.unwrap().unwrap();
        match &state.resources["Record"].config {
            ResourceConfig::DnsRecord(c) => {
                assert_eq!(c.target.as_deref(), hostname.as_str());
            }
            other => panic!("unexpected config {:?}", other),
        }
        assert_eq!(state.tags["project"], "fastapi-eks");
    }

    #[tokio::test]
    async fn test_changed_config_is_an_update() {
        let reconciler = reconciler(Arc::new(DryRunDriver::new()));
        let stack = service_stack(false, "runner");
        let plan = reconciler.plan(&stack).await.unwrap();
        reconciler.apply(&stack, &plan).await.unwrap();

        let changed = service_stack(false, "worker");
        let plan = reconciler.plan(&changed).await.unwrap();
        assert_eq!(
            actions(&plan),
            vec![
                ("Apps".to_string(), ChangeAction::NoOp),
                ("Runner".to_string(), ChangeAction::Update),
            ]
        );
        let report = reconciler.apply(&changed, &plan).await.unwrap();
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.attributes["Runner"]["name"], "worker");
    }

    #[tokio::test]
    async fn test_removed_nodes_are_deleted_newest_first() {
        let driver = Arc::new(DryRunDriver::new());
        let reconciler = reconciler(driver.clone());
        let full = service_stack(true, "runner");
        let plan = reconciler.plan(&full).await.unwrap();
        reconciler.apply(&full, &plan).await.unwrap();

        let trimmed = service_stack(false, "runner");
        let plan = reconciler.plan(&trimmed).await.unwrap();
        assert_eq!(
            actions(&plan),
            vec![
                ("Apps".to_string(), ChangeAction::NoOp),
                ("Runner".to_string(), ChangeAction::NoOp),
                ("Record".to_string(), ChangeAction::Delete),
                ("Ingress".to_string(), ChangeAction::Delete),
            ]
        );
        let report = reconciler.apply(&trimmed, &plan).await.unwrap();
        assert_eq!(report.applied.len(), 2);
        assert_eq!(report.attributes.len(), 2);

        let deletes: Vec<String> = driver
            .calls()
            .into_iter()
            .filter(|c| c.action == "delete")
            .map(|c| c.node)
            .collect();
        assert_eq!(deletes, vec!["Record", "Ingress"]);
    }

    #[tokio::test]
    async fn test_failed_apply_resumes_where_it_stopped() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let stack = service_stack(true, "runner");

        let failing = DriverReconciler::new(
            store.clone(),
            DriverSet::dry_run(Arc::new(DryRunDriver::new().failing_on("Ingress"))),
        );
        let plan = failing.plan(&stack).await.unwrap();
        let err = failing.apply(&stack, &plan).await.unwrap_err();
        match err {
            Error::Reconcile { node, kind, .. } => {
                assert_eq!(node, "Ingress");
                assert_eq!(kind, ResourceKind::RawManifest);
            }
            other => panic!("unexpected error {:?}", other),
        }
        let state = store.load("FastApiService").await.unwrap().unwrap();
        assert_eq!(state.resources.len(), 2);

        let healthy = DriverReconciler::new(store, DriverSet::dry_run(Arc::new(DryRunDriver::new())));
        let plan = healthy.plan(&stack).await.unwrap();
        assert_eq!(plan.summary().to_add, 2);
        assert_eq!(plan.summary().unchanged, 2);
        let report = healthy.apply(&stack, &plan).await.unwrap();
        assert_eq!(report.applied.len(), 2);
    }

    #[tokio::test]
    async fn test_destroy_reverses_apply_order() {
        let driver = Arc::new(DryRunDriver::new());
        let reconciler = reconciler(driver.clone());
        let stack = service_stack(true, "runner");
        let plan = reconciler.plan(&stack).await.unwrap();
        reconciler.apply(&stack, &plan).await.unwrap();

        let deleted = reconciler.destroy("FastApiService").await.unwrap();
        let names: Vec<&str> = deleted.iter().map(|c| c.node.as_str()).collect();
        assert_eq!(names, vec!["Record", "Ingress", "Runner", "Apps"]);
        assert!(reconciler.store().load("FastApiService").await.unwrap().is_none());

        assert!(reconciler.destroy("FastApiService").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_plan_for_another_stack_is_rejected() {
        let reconciler = reconciler(Arc::new(DryRunDriver::new()));
        let stack = service_stack(false, "runner");
        let plan = Plan {
            stack: "Other".to_string(),
            changes: Vec::new(),
        };
        assert!(matches!(
            reconciler.apply(&stack, &plan).await,
            Err(Error::Internal(_))
        ));
    }

    /// "Platform" exports its namespace name; "Workloads" binds it into a
    /// service account.
    fn platform_and_workloads() -> StackSet {
        let mut platform = StackBuilder::new("Platform", env());
        let ns = platform
            .graph_mut()
            .add_node(ResourceKind::Namespace, "Apps", namespace("apps"))
            .unwrap();
        let output = platform.export("namespace", ns, "name").unwrap();

        let mut workloads = StackBuilder::new("Workloads", env());
        workloads.depends_on("Platform");
        let sa = workloads
            .graph_mut()
            .add_node(ResourceKind::ServiceAccount, "Runner", service_account("runner"))
            .unwrap();
        workloads
            .graph_mut()
            .bind_output(sa, "/namespace", output)
            .unwrap();

        let mut set = StackSet::new();
        set.add_stack(platform.build().unwrap()).unwrap();
        set.add_stack(workloads.build().unwrap()).unwrap();
        set
    }

    #[tokio::test]
    async fn test_plan_unit_resolves_recorded_upstream_outputs() {
        let reconciler = reconciler(Arc::new(DryRunDriver::new()));
        let set = platform_and_workloads();

        let fresh = reconciler.plan_unit(&set, "Workloads").await.unwrap();
        assert_eq!(fresh.len(), 2);
        assert_eq!(fresh[1].summary().to_add, 1);

        let platform = set.stack("Platform").unwrap();
        let plan = reconciler.plan(platform).await.unwrap();
        let report = reconciler.apply(platform, &plan).await.unwrap();
        let mut outputs = OutputStore::new();
        outputs.insert("Platform", platform.collect_outputs(&report.attributes).unwrap());
        let workloads = set.stack("Workloads").unwrap().resolve(&outputs).unwrap();
        let plan = reconciler.plan(&workloads).await.unwrap();
        reconciler.apply(&workloads, &plan).await.unwrap();

        let plans = reconciler.plan_unit(&set, "Workloads").await.unwrap();
        let names: Vec<&str> = plans.iter().map(|p| p.stack.as_str()).collect();
        assert_eq!(names, vec!["Platform", "Workloads"]);
        for plan in &plans {
            assert_eq!(plan.summary().to_change, 0, "{}", plan.stack);
            assert!(!plan.has_changes(), "{}", plan.stack);
        }

        let declared = reconciler.plan(set.stack("Workloads").unwrap()).await.unwrap();
        assert_eq!(declared.summary().to_change, 1);
    }
}
