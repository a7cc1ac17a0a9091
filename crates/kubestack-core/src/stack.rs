//! Stacks (deployment units), their outputs and their run status.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::dag::{Dag, EdgeError};
use crate::error::{Error, Result};
use crate::graph::{GraphBuilder, ResourceGraph};
use crate::id::NodeId;
use crate::reconciler::Attributes;

/// Account and region every stack is deployed into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub account: String,
    pub region: String,
}

impl Environment {
    pub fn new(account: impl Into<String>, region: impl Into<String>) -> Result<Self> {
        let account = account.into();
        let region = region.into();
        if account.len() != 12 || !account.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::invalid(
                "environment",
                format!("account '{}' must be 12 digits", account),
            ));
        }
        let region_ok = !region.is_empty()
            && region
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !region_ok {
            return Err(Error::invalid(
                "environment",
                format!("'{}' is not a region name", region),
            ));
        }
        Ok(Self { account, region })
    }
}

/// Typed handle to an output exported by a stack.
///
/// Handles are only minted by [`StackBuilder::export`] and
/// [`Stack::output_ref`], so a handle always names an output that exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OutputRef {
    stack: String,
    name: String,
}

impl OutputRef {
    pub fn stack(&self) -> &str {
        &self.stack
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for OutputRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.stack, self.name)
    }
}

/// Where an output's value comes from once the stack has converged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputDef {
    pub node: NodeId,
    pub attribute: String,
}

/// Output values of one converged stack.
pub type StackOutputs = BTreeMap<String, Value>;

/// Outputs of the stacks converged so far in a run.
#[derive(Debug, Clone, Default)]
pub struct OutputStore {
    stacks: HashMap<String, StackOutputs>,
}

impl OutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, stack: impl Into<String>, outputs: StackOutputs) {
        self.stacks.insert(stack.into(), outputs);
    }

    pub fn stack(&self, stack: &str) -> Option<&StackOutputs> {
        self.stacks.get(stack)
    }

    /// Resolve a handle. Fails while the producing stack has not converged.
    pub fn get(&self, output: &OutputRef) -> Result<&Value> {
        let outputs = self
            .stacks
            .get(&output.stack)
            .ok_or_else(|| Error::DanglingReference {
                stack: output.stack.clone(),
                output: output.name.clone(),
                reason: "producing stack has not converged".to_string(),
            })?;
        outputs.get(&output.name).ok_or_else(|| Error::DanglingReference {
            stack: output.stack.clone(),
            output: output.name.clone(),
            reason: "stack converged without this output".to_string(),
        })
    }
}

/// Builds one stack: its resource graph, tags, outputs and upstream stacks.
#[derive(Debug)]
pub struct StackBuilder {
    name: String,
    tags: BTreeMap<String, String>,
    graph: GraphBuilder,
    depends_on: BTreeSet<String>,
    outputs: BTreeMap<String, OutputDef>,
}

impl StackBuilder {
    pub fn new(name: impl Into<String>, environment: Environment) -> Self {
        let name = name.into();
        Self {
            graph: GraphBuilder::new(name.clone(), environment),
            name,
            tags: BTreeMap::new(),
            depends_on: BTreeSet::new(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &GraphBuilder {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut GraphBuilder {
        &mut self.graph
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn tag(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Require `upstream` to converge before this stack is applied.
    pub fn depends_on(&mut self, upstream: impl Into<String>) -> &mut Self {
        self.depends_on.insert(upstream.into());
        self
    }

    /// Export `attribute` of `node` as output `name` once the stack converges.
    pub fn export(
        &mut self,
        name: impl Into<String>,
        node: NodeId,
        attribute: impl Into<String>,
    ) -> Result<OutputRef> {
        let name = name.into();
        if self.graph.node(node).is_none() {
            return Err(Error::UnknownNode(node.to_string()));
        }
        if self.outputs.contains_key(&name) {
            return Err(Error::DuplicateName {
                scope: format!("outputs of stack '{}'", self.name),
                name,
            });
        }
        self.outputs.insert(
            name.clone(),
            OutputDef {
                node,
                attribute: attribute.into(),
            },
        );
        Ok(OutputRef {
            stack: self.name.clone(),
            name,
        })
    }

    /// Freeze the graph and produce the stack.
    ///
    /// The stack name ends up in state file names and Kubernetes label
    /// values, so it must be a valid label value.
    pub fn build(mut self) -> Result<Stack> {
        if !is_stack_name(&self.name) {
            return Err(Error::invalid(
                &self.name,
                "stack name must be 1-63 letters, digits, '-', '_' or '.', starting and ending with a letter or digit",
            ));
        }
        let graph = self.graph.freeze()?;
        Ok(Stack {
            name: self.name,
            tags: self.tags,
            graph,
            depends_on: self.depends_on,
            outputs: self.outputs,
        })
    }
}

fn is_stack_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            bytes.len() <= 63
                && first.is_ascii_alphanumeric()
                && last.is_ascii_alphanumeric()
                && bytes
                    .iter()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        }
        _ => false,
    }
}

/// A named, tagged deployment unit owning one frozen resource graph.
#[derive(Debug, Clone)]
pub struct Stack {
    name: String,
    tags: BTreeMap<String, String>,
    graph: ResourceGraph,
    depends_on: BTreeSet<String>,
    outputs: BTreeMap<String, OutputDef>,
}

impl Stack {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn graph(&self) -> &ResourceGraph {
        &self.graph
    }

    /// Upstream stacks declared by the builder.
    pub fn declared_dependencies(&self) -> impl Iterator<Item = &str> {
        self.depends_on.iter().map(String::as_str)
    }

    pub fn outputs(&self) -> &BTreeMap<String, OutputDef> {
        &self.outputs
    }

    /// Handle for one of this stack's outputs.
    pub fn output_ref(&self, name: &str) -> Option<OutputRef> {
        self.outputs.contains_key(name).then(|| OutputRef {
            stack: self.name.clone(),
            name: name.to_string(),
        })
    }

    /// Copy of this stack whose upstream bindings are filled from `store`.
    pub fn resolve(&self, store: &OutputStore) -> Result<Stack> {
        let graph = self.graph.resolve_outputs(|output| store.get(output).cloned())?;
        Ok(Stack {
            graph,
            ..self.clone()
        })
    }

    /// Read the exported outputs from the attributes of applied nodes.
    pub fn collect_outputs(&self, attributes: &BTreeMap<String, Attributes>) -> Result<StackOutputs> {
        let mut outputs = StackOutputs::new();
        for (name, def) in &self.outputs {
            let node = self
                .graph
                .node(def.node)
                .ok_or_else(|| Error::UnknownNode(def.node.to_string()))?;
            let value = attributes
                .get(node.name())
                .and_then(|attrs| attrs.get(&def.attribute))
                .cloned()
                .ok_or_else(|| Error::DanglingReference {
                    stack: self.name.clone(),
                    output: name.clone(),
                    reason: format!("'{}' did not produce '{}'", node.name(), def.attribute),
                })?;
            outputs.insert(name.clone(), value);
        }
        Ok(outputs)
    }
}

/// All stacks of one run and the dependency edges between them.
#[derive(Debug, Clone, Default)]
pub struct StackSet {
    stacks: Vec<Stack>,
    index: HashMap<String, usize>,
    dag: Dag,
}

impl StackSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Stack> {
        self.index.get(name).map(|i| &self.stacks[*i])
    }

    pub fn stack(&self, name: &str) -> Result<&Stack> {
        self.get(name)
            .ok_or_else(|| Error::UnknownStack(name.to_string()))
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownStack(name.to_string()))
    }

    /// Add a stack. Its declared upstream stacks must already be present, and
    /// every output it consumes must come from one of its (transitive)
    /// upstream stacks.
    pub fn add_stack(&mut self, stack: Stack) -> Result<()> {
        if self.index.contains_key(stack.name()) {
            return Err(Error::DuplicateName {
                scope: "stack set".to_string(),
                name: stack.name().to_string(),
            });
        }
        let mut upstream = Vec::new();
        for dep in stack.declared_dependencies() {
            if dep == stack.name() {
                return Err(Error::Cycle {
                    dependent: dep.to_string(),
                    dependency: dep.to_string(),
                });
            }
            upstream.push(self.position(dep)?);
        }

        let v = self.dag.add_vertex();
        for u in upstream {
            self.dag
                .add_edge(v, u)
                .map_err(|e| Error::Internal(format!("edge to new stack rejected: {:?}", e)))?;
        }
        self.index.insert(stack.name().to_string(), v);
        self.stacks.push(stack);

        if let Err(e) = self.check_references(v) {
            self.remove_last();
            return Err(e);
        }
        debug!(stack = %self.stacks[v].name(), "Added stack");
        Ok(())
    }

    fn remove_last(&mut self) {
        if let Some(stack) = self.stacks.pop() {
            self.index.remove(stack.name());
            self.dag.pop_vertex();
        }
    }

    fn check_references(&self, v: usize) -> Result<()> {
        let stack = &self.stacks[v];
        let upstream = self.dag.ancestors(v);
        for output in stack.graph().upstream_refs() {
            let producer = self.position(output.stack())?;
            if !upstream.contains(&producer) {
                return Err(Error::DanglingReference {
                    stack: output.stack().to_string(),
                    output: output.name().to_string(),
                    reason: format!(
                        "'{}' consumes it without depending on '{}'",
                        stack.name(),
                        output.stack()
                    ),
                });
            }
            if !self.stacks[producer].outputs().contains_key(output.name()) {
                return Err(Error::DanglingReference {
                    stack: output.stack().to_string(),
                    output: output.name().to_string(),
                    reason: "no such output".to_string(),
                });
            }
        }
        Ok(())
    }

    /// `dependent` must converge after `dependency`. The edge is also recorded
    /// among the dependent's declared dependencies.
    pub fn add_dependency(&mut self, dependent: &str, dependency: &str) -> Result<()> {
        let d = self.position(dependent)?;
        let u = self.position(dependency)?;
        match self.dag.add_edge(d, u) {
            Ok(_) => {
                self.stacks[d].depends_on.insert(dependency.to_string());
                Ok(())
            }
            Err(EdgeError::Cycle) => Err(Error::Cycle {
                dependent: dependent.to_string(),
                dependency: dependency.to_string(),
            }),
            Err(EdgeError::UnknownVertex(v)) => Err(Error::Internal(format!("unknown vertex {}", v))),
        }
    }

    /// Direct upstream stacks of `name`.
    pub fn dependencies(&self, name: &str) -> Result<Vec<&str>> {
        let v = self.position(name)?;
        Ok(self
            .dag
            .dependencies(v)
            .iter()
            .map(|u| self.stacks[*u].name())
            .collect())
    }

    /// Every stack, upstream before downstream, ties in declaration order.
    pub fn topological_order(&self) -> impl Iterator<Item = &Stack> {
        self.dag.topo().map(move |v| &self.stacks[v])
    }

    /// `target` and everything it transitively depends on, in apply order.
    pub fn deploy_order(&self, target: &str) -> Result<Vec<&Stack>> {
        let v = self.position(target)?;
        let mut wanted = self.dag.ancestors(v);
        wanted.insert(v);
        Ok(self
            .dag
            .topo()
            .filter(|u| wanted.contains(u))
            .map(|u| &self.stacks[u])
            .collect())
    }

    /// `target` and everything that transitively depends on it, dependents
    /// first.
    pub fn destroy_order(&self, target: &str) -> Result<Vec<&Stack>> {
        let v = self.position(target)?;
        let mut wanted = self.dag.descendants(v);
        wanted.insert(v);
        let mut order: Vec<&Stack> = self
            .dag
            .topo()
            .filter(|u| wanted.contains(u))
            .map(|u| &self.stacks[u])
            .collect();
        order.reverse();
        Ok(order)
    }
}

/// Stack status during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackStatus {
    Pending,
    Planning,
    Applying,
    Converged,
    Failed,
}

impl StackStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StackStatus::Converged | StackStatus::Failed)
    }

    pub fn can_transition_to(&self, next: StackStatus) -> bool {
        use StackStatus::*;
        matches!(
            (self, next),
            (Pending, Planning)
                | (Planning, Applying)
                | (Planning, Failed)
                | (Applying, Converged)
                | (Applying, Failed)
        )
    }

    /// Validated transition for `stack`.
    pub fn transition(self, stack: &str, next: StackStatus) -> Result<StackStatus> {
        if !self.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                stack: stack.to_string(),
                from: self,
                to: next,
            });
        }
        Ok(next)
    }
}

impl std::fmt::Display for StackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StackStatus::Pending => write!(f, "PENDING"),
            StackStatus::Planning => write!(f, "PLANNING"),
            StackStatus::Applying => write!(f, "APPLYING"),
            StackStatus::Converged => write!(f, "CONVERGED"),
            StackStatus::Failed => write!(f, "FAILED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::*;
    use serde_json::json;

    fn env() -> Environment {
        Environment::new("532673134317", "eu-west-1").unwrap()
    }

    fn cluster_stack() -> (Stack, OutputRef) {
        let mut b = StackBuilder::new("cluster", env());
        b.tag("project", "fastapi-eks");
        let c = b
            .graph_mut()
            .add_node(
                ResourceKind::Cluster,
                "FastApiEksCluster",
                ResourceConfig::Cluster(ClusterConfig {
                    version: "1.32".to_string(),
                    vpc: VpcConfig::default(),
                    capacity: Capacity::default(),
                    logging: vec![],
                    admin_roles: vec![],
                    tags: Default::default(),
                }),
            )
            .unwrap();
        let out = b.export("cluster-name", c, "name").unwrap();
        (b.build().unwrap(), out)
    }

    fn service_stack(name: &str, depends_on: Option<&str>, bind: Option<OutputRef>) -> Stack {
        let mut b = StackBuilder::new(name, env());
        if let Some(up) = depends_on {
            b.depends_on(up);
        }
        let hr = b
            .graph_mut()
            .add_node(
                ResourceKind::HelmRelease,
                "cloudwatch",
                ResourceConfig::HelmRelease(HelmReleaseConfig {
                    chart: "aws-cloudwatch-metrics".to_string(),
                    namespace: "amazon-cloudwatch".to_string(),
                    repository: None,
                    release: Some("cloudwatch-agent".to_string()),
                    version: None,
                    values: json!({}),
                }),
            )
            .unwrap();
        if let Some(output) = bind {
            b.graph_mut().bind_output(hr, "/values/clusterName", output).unwrap();
        }
        b.build().unwrap()
    }

    #[test]
    fn test_stack_names_must_be_label_values() {
        let too_long = "a".repeat(64);
        for name in ["", "../../tmp/x", "my stack", "-cluster", "cluster.", too_long.as_str()] {
            let err = StackBuilder::new(name, env()).build().unwrap_err();
            assert!(matches!(err, Error::InvalidConfig { .. }), "{:?}", name);
        }
        for name in ["EksClassicClusterStack", "a", "fastapi-eks.v2", "eks_cluster"] {
            assert!(StackBuilder::new(name, env()).build().is_ok(), "{:?}", name);
        }
    }

    #[test]
    fn test_environment_validation() {
        assert!(Environment::new("532673134317", "eu-west-1").is_ok());
        assert!(Environment::new("5326", "eu-west-1").is_err());
        assert!(Environment::new("532673134317", "EU WEST").is_err());
    }

    #[test]
    fn test_deploy_and_destroy_order() {
        let (cluster, out) = cluster_stack();
        let mut set = StackSet::new();
        set.add_stack(cluster).unwrap();
        set.add_stack(service_stack("service", Some("cluster"), Some(out))).unwrap();
        set.add_stack(service_stack("other", None, None)).unwrap();

        let deploy: Vec<_> = set.deploy_order("service").unwrap().iter().map(|s| s.name()).collect();
        assert_eq!(deploy, vec!["cluster", "service"]);
        let destroy: Vec<_> = set.destroy_order("cluster").unwrap().iter().map(|s| s.name()).collect();
        assert_eq!(destroy, vec!["service", "cluster"]);
        assert_eq!(set.dependencies("service").unwrap(), vec!["cluster"]);
    }

    #[test]
    fn test_forward_stack_reference_rejected() {
        let mut set = StackSet::new();
        let err = set
            .add_stack(service_stack("service", Some("cluster"), None))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownStack(_)));
    }

    #[test]
    fn test_consuming_output_without_dependency_is_dangling() {
        let (cluster, out) = cluster_stack();
        let mut set = StackSet::new();
        set.add_stack(cluster).unwrap();
        let err = set
            .add_stack(service_stack("service", None, Some(out)))
            .unwrap_err();
        assert!(matches!(err, Error::DanglingReference { .. }));
        assert!(set.get("service").is_none());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_late_dependency_is_declared() {
        let (cluster, _) = cluster_stack();
        let mut set = StackSet::new();
        set.add_stack(cluster).unwrap();
        set.add_stack(service_stack("other", None, None)).unwrap();
        set.add_dependency("other", "cluster").unwrap();

        let declared: Vec<&str> = set.get("other").unwrap().declared_dependencies().collect();
        assert_eq!(declared, set.dependencies("other").unwrap());
        assert_eq!(declared, vec!["cluster"]);
        let deploy: Vec<_> = set.deploy_order("other").unwrap().iter().map(|s| s.name()).collect();
        assert_eq!(deploy, vec!["cluster", "other"]);
    }

    #[test]
    fn test_rejected_stack_leaves_no_edges_behind() {
        let (cluster, out) = cluster_stack();
        let mut set = StackSet::new();
        set.add_stack(cluster).unwrap();
        set.add_stack(service_stack("other", None, None)).unwrap();
        let err = set
            .add_stack(service_stack("service", Some("other"), Some(out.clone())))
            .unwrap_err();
        assert!(matches!(err, Error::DanglingReference { .. }));

        let destroy: Vec<_> = set.destroy_order("other").unwrap().iter().map(|s| s.name()).collect();
        assert_eq!(destroy, vec!["other"]);
        set.add_stack(service_stack("service", Some("cluster"), Some(out)))
            .unwrap();
        let destroy: Vec<_> = set.destroy_order("cluster").unwrap().iter().map(|s| s.name()).collect();
        assert_eq!(destroy, vec!["service", "cluster"]);
        assert_eq!(set.dependencies("service").unwrap(), vec!["cluster"]);
    }

    #[test]
    fn test_stack_cycle_rejected() {
        let mut set = StackSet::new();
        set.add_stack(service_stack("a", None, None)).unwrap();
        set.add_stack(service_stack("b", Some("a"), None)).unwrap();
        assert!(matches!(set.add_dependency("a", "b"), Err(Error::Cycle { .. })));
    }

    #[test]
    fn test_resolve_before_convergence_is_dangling() {
        let (cluster, out) = cluster_stack();
        let service = service_stack("service", Some("cluster"), Some(out));
        let mut store = OutputStore::new();
        assert!(matches!(
            service.resolve(&store),
            Err(Error::DanglingReference { .. })
        ));

        let attributes = BTreeMap::from([(
            "FastApiEksCluster".to_string(),
            Attributes::from([("name".to_string(), json!("fastapi"))]),
        )]);
        store.insert("cluster", cluster.collect_outputs(&attributes).unwrap());
        let resolved = service.resolve(&store).unwrap();
        let node = resolved.graph().node_by_name("cloudwatch").unwrap();
        assert!(node.bindings().is_empty());
        match node.config() {
            ResourceConfig::HelmRelease(h) => assert_eq!(h.values["clusterName"], "fastapi"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_output_attribute() {
        let (cluster, _) = cluster_stack();
        let err = cluster.collect_outputs(&BTreeMap::new()).unwrap_err();
        assert!(matches!(err, Error::DanglingReference { .. }));
    }

    #[test]
    fn test_duplicate_export() {
        let mut b = StackBuilder::new("s", env());
        let ns = b
            .graph_mut()
            .add_node(
                ResourceKind::Namespace,
                "ns",
                ResourceConfig::Namespace(NamespaceConfig {
                    name: "apps".to_string(),
                    labels: Default::default(),
                }),
            )
            .unwrap();
        b.export("ns", ns, "name").unwrap();
        assert!(matches!(b.export("ns", ns, "uid"), Err(Error::DuplicateName { .. })));
    }

    #[test]
    fn test_status_transitions() {
        let s = StackStatus::Pending;
        let s = s.transition("a", StackStatus::Planning).unwrap();
        let s = s.transition("a", StackStatus::Applying).unwrap();
        let s = s.transition("a", StackStatus::Converged).unwrap();
        assert!(s.is_terminal());
        assert!(matches!(
            StackStatus::Pending.transition("a", StackStatus::Applying),
            Err(Error::InvalidTransition { .. })
        ));
        assert!(!StackStatus::Failed.can_transition_to(StackStatus::Planning));
    }
}
