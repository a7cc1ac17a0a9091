//! Resource graph builder and frozen resource graphs.
//!
//! Nodes live in an arena indexed by [`NodeId`]; dependency edges are kept in
//! a separate adjacency structure. A [`GraphBuilder`] accumulates nodes,
//! edges and bindings for one stack and rejects anything that would leave the
//! graph invalid. [`GraphBuilder::freeze`] hands out an immutable
//! [`ResourceGraph`] and locks the builder.

use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

use crate::dag::{Dag, EdgeError, Topo};
use crate::error::{Error, Result};
use crate::id::NodeId;
use crate::reconciler::Attributes;
use crate::resource::{ResourceConfig, ResourceKind, validate_pointer};
use crate::stack::{Environment, OutputRef};

/// One declared resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceNode {
    id: NodeId,
    name: String,
    config: ResourceConfig,
    bindings: Vec<Binding>,
}

impl ResourceNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ResourceKind {
        self.config.kind()
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }
}

/// A value written into a node's config from elsewhere, just before apply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Binding {
    /// JSON pointer into the node's config.
    pub pointer: String,
    pub source: BindingSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum BindingSource {
    /// Attribute produced by another node of the same stack once applied.
    Attribute { node: NodeId, attribute: String },
    /// Output exported by an upstream stack.
    Output(OutputRef),
}

static NEXT_GRAPH: AtomicU32 = AtomicU32::new(0);

/// Accumulates the nodes and edges of one stack.
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    graph: u32,
    stack: String,
    environment: Environment,
    nodes: Vec<ResourceNode>,
    names: HashMap<String, NodeId>,
    dag: Dag,
    frozen: bool,
}

impl GraphBuilder {
    pub fn new(stack: impl Into<String>, environment: Environment) -> Self {
        Self {
            graph: NEXT_GRAPH.fetch_add(1, Ordering::Relaxed),
            stack: stack.into(),
            environment,
            nodes: Vec::new(),
            names: HashMap::new(),
            dag: Dag::default(),
            frozen: false,
        }
    }

    pub fn stack(&self) -> &str {
        &self.stack
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    /// `None` for ids minted by another graph.
    pub fn node(&self, id: NodeId) -> Option<&ResourceNode> {
        (id.graph() == self.graph)
            .then(|| self.nodes.get(id.index()))
            .flatten()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.frozen {
            return Err(Error::FrozenGraph(self.stack.clone()));
        }
        Ok(())
    }

    fn name_of(&self, id: NodeId) -> String {
        self.node(id)
            .map(|n| n.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    /// Declare a node. `config` must be a configuration of `kind`.
    pub fn add_node(
        &mut self,
        kind: ResourceKind,
        name: impl Into<String>,
        config: ResourceConfig,
    ) -> Result<NodeId> {
        self.ensure_mutable()?;
        let name = name.into();

        if name.trim().is_empty() {
            return Err(Error::invalid(name, "node name must not be empty"));
        }
        if self.names.contains_key(&name) {
            return Err(Error::DuplicateName {
                scope: format!("stack '{}'", self.stack),
                name,
            });
        }
        if config.kind() != kind {
            return Err(Error::invalid(
                name,
                format!("expected {} config, got {}", kind, config.kind()),
            ));
        }
        config.validate(&name)?;

        let mut referenced = Vec::new();
        for (target, expected) in config.references() {
            let id = self
                .node_id(target)
                .ok_or_else(|| Error::UnknownNode(target.to_string()))?;
            let actual = self.nodes[id.index()].kind();
            if actual != expected {
                return Err(Error::invalid(
                    name,
                    format!("'{}' is a {}, expected a {}", target, actual, expected),
                ));
            }
            referenced.push(id);
        }

        let id = NodeId::new(self.graph, self.dag.add_vertex());
        self.nodes.push(ResourceNode {
            id,
            name: name.clone(),
            config,
            bindings: Vec::new(),
        });
        self.names.insert(name.clone(), id);
        debug!(stack = %self.stack, node = %name, %kind, "Declared node");

        for dependency in referenced {
            self.add_dependency(id, dependency)?;
        }
        Ok(id)
    }

    /// Require `dependency` to be reconciled before `dependent`.
    ///
    /// Re-adding an existing edge, or one already implied transitively, is
    /// accepted. An edge that would close a cycle is rejected.
    pub fn add_dependency(&mut self, dependent: NodeId, dependency: NodeId) -> Result<()> {
        self.ensure_mutable()?;
        for id in [dependent, dependency] {
            if self.node(id).is_none() {
                return Err(Error::UnknownNode(id.to_string()));
            }
        }
        match self.dag.add_edge(dependent.index(), dependency.index()) {
            Ok(inserted) => {
                if inserted {
                    debug!(
                        stack = %self.stack,
                        dependent = %self.name_of(dependent),
                        dependency = %self.name_of(dependency),
                        "Added dependency"
                    );
                }
                Ok(())
            }
            Err(EdgeError::UnknownVertex(v)) => {
                Err(Error::UnknownNode(NodeId::new(self.graph, v).to_string()))
            }
            Err(EdgeError::Cycle) => Err(Error::Cycle {
                dependent: self.name_of(dependent),
                dependency: self.name_of(dependency),
            }),
        }
    }

    fn check_binding(&self, node: NodeId, pointer: &str) -> Result<()> {
        let target = self
            .node(node)
            .ok_or_else(|| Error::UnknownNode(node.to_string()))?;
        validate_pointer(pointer).map_err(|message| Error::invalid(&target.name, message))?;
        if target.bindings.iter().any(|b| b.pointer == pointer) {
            return Err(Error::invalid(
                &target.name,
                format!("'{}' is already bound", pointer),
            ));
        }
        Ok(())
    }

    /// Fill `pointer` in `node`'s config with `attribute` of `source` once
    /// `source` has been applied. Adds the implied dependency edge.
    pub fn bind_attribute(
        &mut self,
        node: NodeId,
        pointer: impl Into<String>,
        source: NodeId,
        attribute: impl Into<String>,
    ) -> Result<()> {
        self.ensure_mutable()?;
        let pointer = pointer.into();
        let attribute = attribute.into();
        self.check_binding(node, &pointer)?;
        if attribute.trim().is_empty() {
            return Err(Error::invalid(self.name_of(node), "bound attribute name is empty"));
        }
        self.add_dependency(node, source)?;
        self.nodes[node.index()].bindings.push(Binding {
            pointer,
            source: BindingSource::Attribute { node: source, attribute },
        });
        Ok(())
    }

    /// Fill `pointer` in `node`'s config with an upstream stack's output.
    pub fn bind_output(
        &mut self,
        node: NodeId,
        pointer: impl Into<String>,
        output: OutputRef,
    ) -> Result<()> {
        self.ensure_mutable()?;
        let pointer = pointer.into();
        self.check_binding(node, &pointer)?;
        if output.stack() == self.stack {
            return Err(Error::invalid(
                self.name_of(node),
                format!("{} is exported by this stack; bind the node attribute instead", output),
            ));
        }
        self.nodes[node.index()].bindings.push(Binding {
            pointer,
            source: BindingSource::Output(output),
        });
        Ok(())
    }

    /// Deterministic order consistent with every edge; ties go to the node
    /// declared first.
    pub fn topological_order(&self) -> TopologicalOrder<'_> {
        TopologicalOrder {
            graph: self.graph,
            inner: self.dag.topo(),
        }
    }

    /// Snapshot the graph. The builder rejects every further mutation.
    pub fn freeze(&mut self) -> Result<ResourceGraph> {
        self.ensure_mutable()?;
        for node in &self.nodes {
            for field in node.config.deferred_fields() {
                if !node.bindings.iter().any(|b| b.pointer == field) {
                    return Err(Error::invalid(
                        &node.name,
                        format!("'{}' is neither set nor bound", field),
                    ));
                }
            }
        }
        self.frozen = true;
        debug!(stack = %self.stack, nodes = self.nodes.len(), "Froze resource graph");
        Ok(ResourceGraph {
            graph: self.graph,
            stack: self.stack.clone(),
            environment: self.environment.clone(),
            nodes: self.nodes.clone(),
            names: self.names.clone(),
            dag: self.dag.clone(),
        })
    }
}

/// Lazy topological sequence of node ids.
#[derive(Debug, Clone)]
pub struct TopologicalOrder<'a> {
    graph: u32,
    inner: Topo<'a>,
}

impl Iterator for TopologicalOrder<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        self.inner.next().map(|v| NodeId::new(self.graph, v))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Immutable, validated graph of one stack.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    graph: u32,
    stack: String,
    environment: Environment,
    nodes: Vec<ResourceNode>,
    names: HashMap<String, NodeId>,
    dag: Dag,
}

impl ResourceGraph {
    pub fn stack(&self) -> &str {
        &self.stack
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&ResourceNode> {
        (id.graph() == self.graph)
            .then(|| self.nodes.get(id.index()))
            .flatten()
    }

    pub fn node_by_name(&self, name: &str) -> Option<&ResourceNode> {
        self.names.get(name).and_then(|id| self.node(*id))
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.iter()
    }

    /// Direct dependencies of `id`; empty for an id of another graph.
    pub fn dependencies(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.node(id)
            .into_iter()
            .flat_map(move |_| self.dag.dependencies(id.index()).iter())
            .map(move |v| NodeId::new(self.graph, *v))
    }

    pub fn dependents(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.node(id)
            .into_iter()
            .flat_map(move |_| self.dag.dependents(id.index()).iter())
            .map(move |v| NodeId::new(self.graph, *v))
    }

    pub fn topological_order(&self) -> TopologicalOrder<'_> {
        TopologicalOrder {
            graph: self.graph,
            inner: self.dag.topo(),
        }
    }

    /// Outputs of other stacks this graph consumes.
    pub fn upstream_refs(&self) -> impl Iterator<Item = &OutputRef> {
        self.nodes
            .iter()
            .flat_map(|n| n.bindings.iter())
            .filter_map(|b| match &b.source {
                BindingSource::Output(output) => Some(output),
                BindingSource::Attribute { .. } => None,
            })
    }

    /// Splice upstream outputs into the configs that bind them.
    ///
    /// `lookup` fails with `DanglingReference` for an output that is not
    /// available yet; that error is passed through unchanged.
    pub fn resolve_outputs<F>(&self, mut lookup: F) -> Result<ResourceGraph>
    where
        F: FnMut(&OutputRef) -> Result<Value>,
    {
        let mut resolved = self.clone();
        for node in &mut resolved.nodes {
            let mut remaining = Vec::with_capacity(node.bindings.len());
            for binding in std::mem::take(&mut node.bindings) {
                match &binding.source {
                    BindingSource::Output(output) => {
                        let value = lookup(output)?;
                        node.config = node.config.with_value_at(&node.name, &binding.pointer, value)?;
                    }
                    BindingSource::Attribute { .. } => remaining.push(binding),
                }
            }
            node.bindings = remaining;
        }
        Ok(resolved)
    }

    /// The config of `id` with its attribute bindings filled from
    /// `attributes` (keyed by node name).
    pub fn resolve_node(
        &self,
        id: NodeId,
        attributes: &BTreeMap<String, Attributes>,
    ) -> Result<ResourceConfig> {
        let node = self
            .node(id)
            .ok_or_else(|| Error::UnknownNode(id.to_string()))?;
        let mut config = node.config.clone();
        for binding in &node.bindings {
            let value = match &binding.source {
                BindingSource::Attribute { node: source, attribute } => {
                    let source_name = self
                        .node(*source)
                        .map(ResourceNode::name)
                        .ok_or_else(|| Error::UnknownNode(source.to_string()))?;
                    attributes
                        .get(source_name)
                        .and_then(|attrs| attrs.get(attribute))
                        .cloned()
                        .ok_or_else(|| Error::DanglingReference {
                            stack: self.stack.clone(),
                            output: format!("{}.{}", source_name, attribute),
                            reason: format!("'{}' has not produced it", source_name),
                        })?
                }
                BindingSource::Output(output) => {
                    return Err(Error::DanglingReference {
                        stack: output.stack().to_string(),
                        output: output.name().to_string(),
                        reason: "upstream output was not resolved before apply".to_string(),
                    });
                }
            };
            config = config.with_value_at(&node.name, &binding.pointer, value)?;
        }
        Ok(config)
    }

    /// Stable digest of a node's declared state: kind, config and bindings.
    ///
    /// Bindings are described by node name rather than id so inserting an
    /// unrelated node does not change the digest.
    pub fn fingerprint(&self, id: NodeId) -> Result<String> {
        let node = self
            .node(id)
            .ok_or_else(|| Error::UnknownNode(id.to_string()))?;
        let bindings: Vec<Value> = node
            .bindings
            .iter()
            .map(|b| {
                let source = match &b.source {
                    BindingSource::Attribute { node, attribute } => json!({
                        "node": self.node(*node).map(ResourceNode::name),
                        "attribute": attribute,
                    }),
                    BindingSource::Output(output) => json!({
                        "stack": output.stack(),
                        "output": output.name(),
                    }),
                };
                json!({"pointer": b.pointer, "source": source})
            })
            .collect();
        let doc = json!({
            "config": node.config,
            "bindings": bindings,
        });
        let bytes = serde_json::to_vec(&doc)
            .map_err(|e| Error::Internal(format!("fingerprint '{}': {}", node.name, e)))?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}
