//! Stack file parsing.
//!
//! A stack file declares the deployment environment, free variables and one
//! `stack` node per deployment unit:
//!
//! ```kdl
//! environment account="532673134317" region="eu-west-1"
//! variable "project" "fastapi-eks"
//!
//! stack "FastApiEksCluster" {
//!     tags project="${var.project}"
//!     cluster "Cluster" version="1.32"
//!     output "cluster-name" node="Cluster" attribute="name"
//! }
//!
//! stack "FastApiService" depends-on="FastApiEksCluster" {
//!     manifest "Deployment" file="manifests/deployment.json"
//! }
//! ```
//!
//! Resource nodes are named by their first argument and may carry
//! `needs="<node>"` properties (repeatable) and `bind` children. Nodes,
//! stacks and outputs can only refer to things declared above them.

use kdl::{KdlDocument, KdlNode, KdlValue};
use kubestack_core::resource::{
    Capacity, ClusterConfig, ControlPlaneLog, DnsRecordConfig, FargateCapacity, FargateProfile,
    HelmReleaseConfig, NamespaceConfig, NodeGroupCapacity, PolicyAttachmentConfig,
    RawManifestConfig, RecordType, RoleMapping, ServiceAccountConfig, VpcConfig,
};
use kubestack_core::{
    Environment, NodeId, ResourceConfig, ResourceKind, Stack, StackBuilder, StackSet,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::documents::DocumentLoader;
use crate::variables::VariableContext;
use crate::{ConfigError, ConfigResult};

/// Default stack file name looked up in the working directory.
pub const STACK_FILE_NAME: &str = "kubestack.kdl";

/// A parsed and validated stack file.
#[derive(Debug)]
pub struct StackFile {
    pub environment: Environment,
    pub variables: VariableContext,
    pub stacks: StackSet,
}

/// Read and parse a stack file. Documents are resolved next to it and
/// `${os.*}` comes from the process environment.
pub fn load_stack_file(path: impl AsRef<Path>) -> ConfigResult<StackFile> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

    let mut vars = VariableContext::new();
    vars.populate_os();

    let file = parse_stack_file(&text, &DocumentLoader::new(base_dir), vars)?;
    info!(path = %path.display(), stacks = file.stacks.len(), "Loaded stack file");
    Ok(file)
}

/// Parse a stack file from KDL text.
pub fn parse_stack_file(
    kdl: &str,
    loader: &DocumentLoader,
    mut vars: VariableContext,
) -> ConfigResult<StackFile> {
    let doc: KdlDocument = kdl.parse()?;

    let mut environment = None;
    for node in doc.nodes().iter().filter(|n| n.name().value() == "environment") {
        if environment.is_some() {
            return Err(ConfigError::Duplicate("environment".to_string()));
        }
        let account = get_string_prop(node, "account")
            .map(|s| vars.interpolate(&s))
            .ok_or_else(|| ConfigError::MissingField("environment account".to_string()))?;
        let region = get_string_prop(node, "region")
            .map(|s| vars.interpolate(&s))
            .ok_or_else(|| ConfigError::MissingField("environment region".to_string()))?;
        let env = Environment::new(account, region)?;
        vars.account = Some(env.account.clone());
        vars.region = Some(env.region.clone());
        environment = Some(env);
    }
    let environment =
        environment.ok_or_else(|| ConfigError::MissingField("environment".to_string()))?;

    for node in doc.nodes().iter().filter(|n| n.name().value() == "variable") {
        let name = get_first_string_arg(node)
            .ok_or_else(|| ConfigError::MissingField("variable name".to_string()))?;
        let value = node
            .entries()
            .iter()
            .filter(|e| e.name().is_none())
            .nth(1)
            .map(|e| scalar_to_string(e.value()))
            .ok_or_else(|| ConfigError::MissingField(format!("value of variable '{}'", name)))?;
        if vars.vars.contains_key(&name) {
            return Err(ConfigError::Duplicate(format!("variable '{}'", name)));
        }
        let value = vars.interpolate(&value);
        vars.set(&name, value);
    }

    let mut stacks = StackSet::new();
    for node in doc.nodes() {
        match node.name().value() {
            "environment" | "variable" => {}
            "stack" => {
                let stack = StackParser::new(loader, &vars, &stacks, &environment, node)?
                    .parse(node)?;
                stacks.add_stack(stack)?;
            }
            other => warn!(node = %other, "Ignoring unknown top-level node"),
        }
    }

    if stacks.is_empty() {
        return Err(ConfigError::MissingField("stack".to_string()));
    }

    Ok(StackFile {
        environment,
        variables: vars,
        stacks,
    })
}

/// Parses one `stack` node into a [`Stack`].
struct StackParser<'a> {
    loader: &'a DocumentLoader,
    upstream: &'a StackSet,
    vars: VariableContext,
    builder: StackBuilder,
}

impl<'a> StackParser<'a> {
    fn new(
        loader: &'a DocumentLoader,
        vars: &VariableContext,
        upstream: &'a StackSet,
        environment: &Environment,
        node: &KdlNode,
    ) -> ConfigResult<Self> {
        let name = get_first_string_arg(node)
            .ok_or_else(|| ConfigError::MissingField("stack name".to_string()))?;
        let mut vars = vars.clone();
        vars.stack = Some(name.clone());
        Ok(Self {
            loader,
            upstream,
            vars,
            builder: StackBuilder::new(name, environment.clone()),
        })
    }

    fn parse(mut self, node: &KdlNode) -> ConfigResult<Stack> {
        for upstream in get_string_list_prop(node, "depends-on") {
            let upstream = self.text(&upstream);
            if self.upstream.get(&upstream).is_none() {
                return Err(ConfigError::InvalidReference(format!(
                    "stack '{}' depends on unknown stack '{}'",
                    self.builder.name(),
                    upstream
                )));
            }
            self.builder.depends_on(upstream);
        }

        for child in children(node) {
            match child.name().value() {
                "tags" => {
                    for (key, value) in self.map_props(child) {
                        self.builder.tag(key, value);
                    }
                }
                "output" => self.parse_output(child)?,
                other => {
                    let kind = resource_kind(other).ok_or_else(|| {
                        ConfigError::invalid(
                            format!("stack '{}'", self.builder.name()),
                            format!("unknown node '{}'", other),
                        )
                    })?;
                    self.parse_resource(kind, child)?;
                }
            }
        }

        debug!(
            stack = %self.builder.name(),
            nodes = self.builder.graph().len(),
            "Parsed stack"
        );
        Ok(self.builder.build()?)
    }

    /// Interpolate `raw`, warning about variables that do not resolve.
    fn text(&self, raw: &str) -> String {
        for name in self.vars.unresolved(raw) {
            warn!(stack = ?self.vars.stack, variable = %name, "Unresolved variable");
        }
        self.vars.interpolate(raw)
    }

    fn string_prop(&self, node: &KdlNode, name: &str) -> Option<String> {
        get_string_prop(node, name).map(|s| self.text(&s))
    }

    fn required_prop(&self, node: &KdlNode, name: &str) -> ConfigResult<String> {
        self.string_prop(node, name).ok_or_else(|| {
            ConfigError::MissingField(format!(
                "{} for {} '{}'",
                name,
                node.name().value(),
                get_first_string_arg(node).unwrap_or_default()
            ))
        })
    }

    fn u32_prop(&self, node: &KdlNode, name: &str) -> ConfigResult<Option<u32>> {
        match node.get(name) {
            None => Ok(None),
            Some(value) => value
                .as_integer()
                .and_then(|i| u32::try_from(i).ok())
                .map(Some)
                .ok_or_else(|| {
                    ConfigError::invalid(name, format!("expected a non-negative integer, got {}", value))
                }),
        }
    }

    /// Every `key=value` property of `node`, interpolated.
    fn map_props(&self, node: &KdlNode) -> BTreeMap<String, String> {
        node.entries()
            .iter()
            .filter_map(|e| {
                e.name()
                    .map(|k| (k.value().to_string(), self.text(&scalar_to_string(e.value()))))
            })
            .collect()
    }

    fn to_json(&self, value: &KdlValue) -> Value {
        match value {
            KdlValue::String(s) => Value::String(self.text(s)),
            KdlValue::Integer(i) => i64::try_from(*i)
                .map(Value::from)
                .unwrap_or_else(|_| Value::String(i.to_string())),
            KdlValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            KdlValue::Bool(b) => Value::Bool(*b),
            KdlValue::Null => Value::Null,
        }
    }

    fn node_id(&self, name: &str, referrer: &str) -> ConfigResult<NodeId> {
        self.builder.graph().node_id(name).ok_or_else(|| {
            ConfigError::InvalidReference(format!(
                "'{}' in stack '{}' refers to unknown node '{}'",
                referrer,
                self.builder.name(),
                name
            ))
        })
    }

    fn parse_resource(&mut self, kind: ResourceKind, node: &KdlNode) -> ConfigResult<()> {
        let name = get_first_string_arg(node)
            .ok_or_else(|| ConfigError::MissingField(format!("{} name", kind)))?;

        let config = match kind {
            ResourceKind::Cluster => ResourceConfig::Cluster(self.cluster(node)?),
            ResourceKind::Namespace => ResourceConfig::Namespace(self.namespace(&name, node)?),
            ResourceKind::ServiceAccount => {
                ResourceConfig::ServiceAccount(self.service_account(&name, node)?)
            }
            ResourceKind::PolicyAttachment => {
                ResourceConfig::PolicyAttachment(self.policy_attachment(node)?)
            }
            ResourceKind::HelmRelease => ResourceConfig::HelmRelease(self.helm_release(node)?),
            ResourceKind::RawManifest => ResourceConfig::RawManifest(self.raw_manifest(node)?),
            ResourceKind::DnsRecord => ResourceConfig::DnsRecord(self.dns_record(node)?),
        };

        let id = self.builder.graph_mut().add_node(kind, name.clone(), config)?;

        for dependency in get_string_list_prop(node, "needs") {
            let dependency = self.node_id(&self.text(&dependency), &name)?;
            self.builder.graph_mut().add_dependency(id, dependency)?;
        }

        for bind in children(node).iter().filter(|c| c.name().value() == "bind") {
            self.parse_bind(id, &name, bind)?;
        }
        Ok(())
    }

    /// `bind "/pointer" node="X" attribute="a"` or
    /// `bind "/pointer" stack="S" output="o"`.
    fn parse_bind(&mut self, id: NodeId, name: &str, bind: &KdlNode) -> ConfigResult<()> {
        let pointer = get_first_string_arg(bind)
            .ok_or_else(|| ConfigError::MissingField(format!("bind pointer for '{}'", name)))?;

        match (self.string_prop(bind, "node"), self.string_prop(bind, "stack")) {
            (Some(source), None) => {
                let attribute = self.required_prop(bind, "attribute")?;
                let source = self.node_id(&source, name)?;
                self.builder
                    .graph_mut()
                    .bind_attribute(id, pointer, source, attribute)?;
            }
            (None, Some(stack)) => {
                let output = self.required_prop(bind, "output")?;
                let output_ref = self
                    .upstream
                    .get(&stack)
                    .and_then(|s| s.output_ref(&output))
                    .ok_or_else(|| {
                        ConfigError::InvalidReference(format!(
                            "'{}' binds unknown output {}.{}",
                            name, stack, output
                        ))
                    })?;
                self.builder.graph_mut().bind_output(id, pointer, output_ref)?;
            }
            _ => {
                return Err(ConfigError::invalid(
                    format!("bind on '{}'", name),
                    "exactly one of node= or stack= is required",
                ));
            }
        }
        Ok(())
    }

    /// `output "name" node="X" attribute="a"`
    fn parse_output(&mut self, node: &KdlNode) -> ConfigResult<()> {
        let name = get_first_string_arg(node)
            .ok_or_else(|| ConfigError::MissingField("output name".to_string()))?;
        let source = self.required_prop(node, "node")?;
        let attribute = self.required_prop(node, "attribute")?;
        let id = self.node_id(&source, &format!("output {}", name))?;
        self.builder.export(name, id, attribute)?;
        Ok(())
    }

    fn cluster(&self, node: &KdlNode) -> ConfigResult<ClusterConfig> {
        let version = self.required_prop(node, "version")?;
        let mut vpc = VpcConfig::default();
        let mut capacity = None;
        let mut logging = Vec::new();
        let mut admin_roles = Vec::new();
        let mut tags = self.builder.tags().clone();

        for child in children(node) {
            match child.name().value() {
                "vpc" => {
                    if let Some(max_azs) = self.u32_prop(child, "max-azs")? {
                        vpc.max_azs = u8::try_from(max_azs)
                            .map_err(|_| ConfigError::invalid("max-azs", "too large"))?;
                    }
                    if let Some(nat) = self.u32_prop(child, "nat-gateways")? {
                        vpc.nat_gateways = Some(
                            u8::try_from(nat)
                                .map_err(|_| ConfigError::invalid("nat-gateways", "too large"))?,
                        );
                    }
                }
                "nodegroup" => {
                    if capacity.is_some() {
                        return Err(ConfigError::Duplicate("cluster capacity".to_string()));
                    }
                    let mut ng = NodeGroupCapacity::default();
                    if let Some(instance_type) = self.string_prop(child, "instance-type") {
                        ng.instance_type = instance_type;
                    }
                    if let Some(desired) = self.u32_prop(child, "desired")? {
                        ng.desired = desired;
                    }
                    if let Some(min) = self.u32_prop(child, "min")? {
                        ng.min = min;
                    }
                    if let Some(max) = self.u32_prop(child, "max")? {
                        ng.max = max;
                    }
                    for labels in children(child).iter().filter(|c| c.name().value() == "labels") {
                        ng.labels.extend(self.map_props(labels));
                    }
                    capacity = Some(Capacity::NodeGroup(ng));
                }
                "fargate" => {
                    if capacity.is_some() {
                        return Err(ConfigError::Duplicate("cluster capacity".to_string()));
                    }
                    let profiles = children(child)
                        .iter()
                        .filter(|c| c.name().value() == "profile")
                        .map(|p| -> ConfigResult<FargateProfile> {
                            let mut args = get_all_string_args(p).into_iter().map(|s| self.text(&s));
                            let name = args.next().ok_or_else(|| {
                                ConfigError::MissingField("fargate profile name".to_string())
                            })?;
                            Ok(FargateProfile {
                                name,
                                namespaces: args.collect(),
                            })
                        })
                        .collect::<ConfigResult<Vec<_>>>()?;
                    capacity = Some(Capacity::Fargate(FargateCapacity { profiles }));
                }
                "logging" => {
                    for log in get_all_string_args(child) {
                        let log: ControlPlaneLog = log
                            .parse()
                            .map_err(|message| ConfigError::invalid("logging", message))?;
                        logging.push(log);
                    }
                }
                "admin-role" => {
                    let arn = get_first_string_arg(child)
                        .map(|s| self.text(&s))
                        .ok_or_else(|| ConfigError::MissingField("admin-role arn".to_string()))?;
                    admin_roles.push(RoleMapping {
                        arn,
                        username: self.string_prop(child, "username"),
                        groups: get_string_list_prop(child, "group")
                            .iter()
                            .map(|g| self.text(g))
                            .collect(),
                    });
                }
                "tags" => tags.extend(self.map_props(child)),
                "bind" => {}
                other => return Err(unknown_child("cluster", other)),
            }
        }

        Ok(ClusterConfig {
            version,
            vpc,
            capacity: capacity.unwrap_or_default(),
            logging,
            admin_roles,
            tags,
        })
    }

    fn namespace(&self, name: &str, node: &KdlNode) -> ConfigResult<NamespaceConfig> {
        let mut labels = BTreeMap::new();
        for child in children(node) {
            match child.name().value() {
                "labels" => labels.extend(self.map_props(child)),
                "bind" => {}
                other => return Err(unknown_child("namespace", other)),
            }
        }
        Ok(NamespaceConfig {
            name: self.string_prop(node, "name").unwrap_or_else(|| name.to_string()),
            labels,
        })
    }

    fn service_account(&self, name: &str, node: &KdlNode) -> ConfigResult<ServiceAccountConfig> {
        let mut labels = BTreeMap::new();
        let mut annotations = BTreeMap::new();
        for child in children(node) {
            match child.name().value() {
                "labels" => labels.extend(self.map_props(child)),
                "annotations" => annotations.extend(self.map_props(child)),
                "bind" => {}
                other => return Err(unknown_child("service-account", other)),
            }
        }
        Ok(ServiceAccountConfig {
            name: self.string_prop(node, "name").unwrap_or_else(|| name.to_string()),
            namespace: self.required_prop(node, "namespace")?,
            labels,
            annotations,
        })
    }

    fn policy_attachment(&self, node: &KdlNode) -> ConfigResult<PolicyAttachmentConfig> {
        reject_children(node, "policy-attachment")?;
        let document = match self.string_prop(node, "document") {
            Some(path) => Some(self.loader.load_object(&path, &self.vars)?),
            None => None,
        };
        Ok(PolicyAttachmentConfig {
            service_account: self.required_prop(node, "service-account")?,
            policy_name: self.string_prop(node, "policy-name"),
            document,
            managed_policy_arn: self.string_prop(node, "managed-policy-arn"),
        })
    }

    /// Values start from `values-file=` and are overridden by
    /// `set "dotted.key" value` children, as with `helm --set`.
    fn helm_release(&self, node: &KdlNode) -> ConfigResult<HelmReleaseConfig> {
        let mut values = match self.string_prop(node, "values-file") {
            Some(path) => self.loader.load_object(&path, &self.vars)?,
            None => Value::Object(Map::new()),
        };

        for child in children(node) {
            match child.name().value() {
                "set" => {
                    let key = get_first_string_arg(child)
                        .ok_or_else(|| ConfigError::MissingField("set key".to_string()))?;
                    let value = child
                        .entries()
                        .iter()
                        .filter(|e| e.name().is_none())
                        .nth(1)
                        .map(|e| self.to_json(e.value()))
                        .ok_or_else(|| ConfigError::MissingField(format!("value for set '{}'", key)))?;
                    set_dotted(&mut values, &key, value)?;
                }
                "bind" => {}
                other => return Err(unknown_child("helm-release", other)),
            }
        }

        Ok(HelmReleaseConfig {
            chart: self.required_prop(node, "chart")?,
            namespace: self.required_prop(node, "namespace")?,
            repository: self.string_prop(node, "repository"),
            release: self.string_prop(node, "release"),
            version: self.string_prop(node, "version"),
            values,
        })
    }

    fn raw_manifest(&self, node: &KdlNode) -> ConfigResult<RawManifestConfig> {
        reject_children(node, "manifest")?;
        let path = self.required_prop(node, "file")?;
        let mut body = self.loader.load_object(&path, &self.vars)?;
        if let Some(namespace) = self.string_prop(node, "namespace") {
            set_dotted(&mut body, "metadata.namespace", Value::String(namespace))?;
        }
        Ok(RawManifestConfig { body })
    }

    fn dns_record(&self, node: &KdlNode) -> ConfigResult<DnsRecordConfig> {
        reject_children(node, "dns-record")?;
        let record_type = match self.string_prop(node, "type").as_deref() {
            None | Some("CNAME") => RecordType::Cname,
            Some("A") => RecordType::A,
            Some(other) => {
                return Err(ConfigError::invalid(
                    "dns-record type",
                    format!("unsupported record type '{}'", other),
                ));
            }
        };
        Ok(DnsRecordConfig {
            zone: self.required_prop(node, "zone")?,
            record_name: self.required_prop(node, "record")?,
            record_type,
            target: self.string_prop(node, "target"),
            ttl_seconds: self.u32_prop(node, "ttl")?.unwrap_or(300),
        })
    }
}

fn resource_kind(node_name: &str) -> Option<ResourceKind> {
    match node_name {
        "manifest" => Some(ResourceKind::RawManifest),
        other => other.parse().ok(),
    }
}

fn unknown_child(kind: &str, child: &str) -> ConfigError {
    ConfigError::invalid(kind, format!("unknown child node '{}'", child))
}

/// Kinds configured by properties alone accept nothing but `bind` children.
fn reject_children(node: &KdlNode, kind: &str) -> ConfigResult<()> {
    match children(node).iter().find(|c| c.name().value() != "bind") {
        Some(child) => Err(unknown_child(kind, child.name().value())),
        None => Ok(()),
    }
}

/// Write `value` at a dotted key path, creating intermediate objects.
fn set_dotted(target: &mut Value, key: &str, value: Value) -> ConfigResult<()> {
    let parts: Vec<&str> = key.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(ConfigError::invalid("set", format!("'{}' is not a dotted key", key)));
    }
    let (last, parents) = parts
        .split_last()
        .ok_or_else(|| ConfigError::invalid("set", "empty key"))?;

    let mut cursor = target;
    for part in parents {
        let map = cursor
            .as_object_mut()
            .ok_or_else(|| ConfigError::invalid("set", format!("'{}' crosses a non-object", key)))?;
        cursor = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let map = cursor
        .as_object_mut()
        .ok_or_else(|| ConfigError::invalid("set", format!("'{}' crosses a non-object", key)))?;
    map.insert(last.to_string(), value);
    Ok(())
}

// Helper functions for extracting values from KDL nodes

fn children(node: &KdlNode) -> &[KdlNode] {
    node.children().map(KdlDocument::nodes).unwrap_or(&[])
}

fn scalar_to_string(value: &KdlValue) -> String {
    match value {
        KdlValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

/// Collect a repeatable property (`needs="a" needs="b"`).
fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_some_and(|n| n.value() == name))
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::VariableContextBuilder;
    use kubestack_core::Error as CoreError;

    fn parse(kdl: &str) -> ConfigResult<StackFile> {
        parse_stack_file(kdl, &DocumentLoader::new("."), VariableContext::new())
    }

    fn order(file: &StackFile, stack: &str) -> Vec<String> {
        let graph = file.stacks.get(stack).unwrap().graph();
        graph
            .topological_order()
            .map(|id| graph.node(id).unwrap().name().to_string())
            .collect()
    }

    const BOOTSTRAP: &str = r#"
        environment account="532673134317" region="eu-west-1"

        stack "Autoscaling" {
            tags project="fastapi-eks" env="dev"
            cluster "Cluster" version="1.32" {
                nodegroup instance-type="m5.xlarge" desired=1 min=1 max=1
                logging "api" "audit" "authenticator" "controllerManager" "scheduler"
                admin-role "arn:aws:iam::${env.account}:role/Admin" username="sso-admin" group="system:masters"
            }
            namespace "KarpenterNs" name="karpenter" needs="Cluster"
            service-account "KarpenterSa" name="karpenter" namespace="karpenter" needs="KarpenterNs"
            helm-release "Karpenter" chart="karpenter" namespace="karpenter" repository="oci://public.ecr.aws/karpenter" needs="KarpenterSa" {
                set "serviceAccount.create" "false"
                set "replicas" 2
                bind "/values/settings/clusterName" node="Cluster" attribute="name"
            }
            output "cluster-name" node="Cluster" attribute="name"
        }
    "#;

    #[test]
    fn test_parse_bootstrap_chain() {
        let file = parse(BOOTSTRAP).unwrap();
        assert_eq!(file.environment.region, "eu-west-1");
        assert_eq!(
            order(&file, "Autoscaling"),
            vec!["Cluster", "KarpenterNs", "KarpenterSa", "Karpenter"]
        );

        let stack = file.stacks.get("Autoscaling").unwrap();
        assert_eq!(stack.tags()["project"], "fastapi-eks");
        assert!(stack.output_ref("cluster-name").is_some());

        let cluster = stack.graph().node_by_name("Cluster").unwrap();
        match cluster.config() {
            ResourceConfig::Cluster(c) => {
                assert_eq!(c.logging.len(), 5);
                assert_eq!(c.admin_roles[0].arn, "arn:aws:iam::532673134317:role/Admin");
                assert_eq!(c.admin_roles[0].groups, vec!["system:masters"]);
                assert_eq!(c.tags["env"], "dev");
            }
            other => panic!("unexpected {:?}", other),
        }

        let release = stack.graph().node_by_name("Karpenter").unwrap();
        assert_eq!(release.bindings().len(), 1);
        match release.config() {
            ResourceConfig::HelmRelease(h) => {
                assert_eq!(h.values["serviceAccount"]["create"], "false");
                assert_eq!(h.values["replicas"], 2);
                assert_eq!(h.release_name(), "karpenter");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_fargate_capacity() {
        let kdl = r#"
            environment account="532673134317" region="eu-west-1"
            stack "Serverless" {
                cluster "Cluster" version="1.32" {
                    fargate {
                        profile "system" "kube-system"
                        profile "app" "default" "fastapi" "application"
                    }
                }
            }
        "#;
        let file = parse(kdl).unwrap();
        let cluster = file.stacks.get("Serverless").unwrap().graph().node_by_name("Cluster").unwrap();
        match cluster.config() {
            ResourceConfig::Cluster(c) => match &c.capacity {
                Capacity::Fargate(f) => {
                    assert_eq!(f.profiles.len(), 2);
                    assert_eq!(f.profiles[1].namespaces, vec!["default", "fastapi", "application"]);
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cross_stack_binding() {
        let kdl = r#"
            environment account="532673134317" region="eu-west-1"
            variable "domain" "piercuta.com"
            stack "Cluster" {
                cluster "Cluster" version="1.32"
                output "cluster-name" node="Cluster" attribute="name"
            }
            stack "Service" depends-on="Cluster" {
                helm-release "Metrics" chart="metrics-server" namespace="kube-system" {
                    bind "/values/clusterName" stack="Cluster" output="cluster-name"
                }
                dns-record "Record" zone="${var.domain}" record="my-fastapi" {
                    bind "/target" node="Metrics" attribute="status"
                }
            }
        "#;
        let file = parse(kdl).unwrap();
        assert_eq!(file.stacks.dependencies("Service").unwrap(), vec!["Cluster"]);
        let service = file.stacks.get("Service").unwrap();
        assert_eq!(service.graph().upstream_refs().count(), 1);
        match service.graph().node_by_name("Record").unwrap().config() {
            ResourceConfig::DnsRecord(r) => {
                assert_eq!(r.fqdn(), "my-fastapi.piercuta.com");
                assert_eq!(r.ttl_seconds, 300);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_output_binding_requires_stack_dependency() {
        let kdl = r#"
            environment account="532673134317" region="eu-west-1"
            stack "Cluster" {
                cluster "Cluster" version="1.32"
                output "cluster-name" node="Cluster" attribute="name"
            }
            stack "Service" {
                helm-release "Metrics" chart="metrics-server" namespace="kube-system" {
                    bind "/values/clusterName" stack="Cluster" output="cluster-name"
                }
            }
        "#;
        assert!(matches!(
            parse(kdl),
            Err(ConfigError::Core(CoreError::DanglingReference { .. }))
        ));
    }

    #[test]
    fn test_forward_references_rejected() {
        let kdl = r#"
            environment account="532673134317" region="eu-west-1"
            stack "S" {
                namespace "Ns" name="apps" needs="Cluster"
                cluster "Cluster" version="1.32"
            }
        "#;
        assert!(matches!(parse(kdl), Err(ConfigError::InvalidReference(_))));

        let kdl = r#"
            environment account="532673134317" region="eu-west-1"
            stack "B" depends-on="A" {
                namespace "Ns" name="apps"
            }
            stack "A" {
                namespace "Ns" name="apps"
            }
        "#;
        assert!(matches!(parse(kdl), Err(ConfigError::InvalidReference(_))));
    }

    #[test]
    fn test_duplicate_node_names() {
        let kdl = r#"
            environment account="532673134317" region="eu-west-1"
            stack "S" {
                namespace "Shared" name="apps"
                helm-release "Shared" chart="metrics-server" namespace="kube-system"
            }
        "#;
        assert!(matches!(
            parse(kdl),
            Err(ConfigError::Core(CoreError::DuplicateName { .. }))
        ));
    }

    #[test]
    fn test_missing_required_fields() {
        let kdl = r#"
            environment account="532673134317" region="eu-west-1"
            stack "S" {
                helm-release "Alb" namespace="kube-system"
            }
        "#;
        assert!(matches!(parse(kdl), Err(ConfigError::MissingField(_))));

        let kdl = r#"
            stack "S" {
                namespace "Ns" name="apps"
            }
        "#;
        assert!(matches!(parse(kdl), Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_unknown_resource_kind() {
        let kdl = r#"
            environment account="532673134317" region="eu-west-1"
            stack "S" {
                load-balancer "Alb"
            }
        "#;
        assert!(matches!(parse(kdl), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_documents_loaded_relative_to_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("policy.json"),
            r#"{"Version": "2012-10-17", "Statement": [{"Effect": "Allow", "Action": "logs:*", "Resource": "*"}]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("configmap.json"),
            r#"{"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "fargate-alb-config"}, "data": {"region": "${env.region}"}}"#,
        )
        .unwrap();

        let kdl = r#"
            environment account="532673134317" region="eu-west-1"
            stack "S" {
                service-account "CwSa" name="cloudwatch-agent" namespace="amazon-cloudwatch"
                policy-attachment "CwPolicy" service-account="CwSa" document="policy.json"
                manifest "AlbConfig" file="configmap.json" namespace="kube-system"
            }
        "#;
        let file =
            parse_stack_file(kdl, &DocumentLoader::new(dir.path()), VariableContext::new()).unwrap();
        let graph = file.stacks.get("S").unwrap().graph();
        assert_eq!(graph.len(), 3);
        match graph.node_by_name("AlbConfig").unwrap().config() {
            ResourceConfig::RawManifest(m) => {
                assert_eq!(m.namespace(), Some("kube-system"));
                assert_eq!(m.body["data"]["region"], "eu-west-1");
            }
            other => panic!("unexpected {:?}", other),
        }
        let policy = graph.node_by_name("CwPolicy").unwrap();
        let sa = graph.node_by_name("CwSa").unwrap();
        assert_eq!(graph.dependencies(policy.id()).collect::<Vec<_>>(), vec![sa.id()]);
    }

    #[test]
    fn test_os_variables_in_environment() {
        let vars = VariableContextBuilder::new()
            .with_os("AWS_ACCOUNT", "532673134317")
            .build();
        let kdl = r#"
            environment account="${os.AWS_ACCOUNT}" region="eu-west-1"
            stack "S" {
                namespace "Ns" name="apps"
            }
        "#;
        let file = parse_stack_file(kdl, &DocumentLoader::new("."), vars).unwrap();
        assert_eq!(file.environment.account, "532673134317");
    }

    #[test]
    fn test_set_dotted() {
        let mut values = serde_json::json!({"serviceAccount": {"create": "false"}});
        set_dotted(&mut values, "serviceAccount.name", Value::from("alb")).unwrap();
        set_dotted(&mut values, "region", Value::from("eu-west-1")).unwrap();
        assert_eq!(values["serviceAccount"]["name"], "alb");
        assert_eq!(values["serviceAccount"]["create"], "false");
        assert!(set_dotted(&mut values, "region.inner", Value::Null).is_err());
        assert!(set_dotted(&mut values, "a..b", Value::Null).is_err());
    }

    #[test]
    fn test_demo_stack_files() {
        let demos = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos");

        let classic = load_stack_file(demos.join("classic.kdl")).unwrap();
        let names: Vec<&str> = classic
            .stacks
            .deploy_order("EksClassicFastApiServiceStack")
            .unwrap()
            .into_iter()
            .map(|s| s.name())
            .collect();
        assert_eq!(names, vec!["EksClassicClusterStack", "EksClassicFastApiServiceStack"]);
        assert_eq!(classic.stacks.get("EksClassicClusterStack").unwrap().graph().len(), 9);
        let service = classic.stacks.get("EksClassicFastApiServiceStack").unwrap().graph();
        assert_eq!(service.len(), 5);
        match service.node_by_name("FastApiDeployment").unwrap().config() {
            ResourceConfig::RawManifest(m) => assert_eq!(
                m.body["spec"]["template"]["spec"]["containers"][0]["image"],
                "532673134317.dkr.ecr.eu-west-1.amazonaws.com/services/eks/fastapi_hello_world:latest"
            ),
            other => panic!("unexpected config {:?}", other),
        }

        let fargate = load_stack_file(demos.join("fargate.kdl")).unwrap();
        let cluster = fargate.stacks.get("EksFargateClusterStack").unwrap().graph();
        match cluster.node_by_name("FastApiEksFargateCluster").unwrap().config() {
            ResourceConfig::Cluster(c) => match &c.capacity {
                Capacity::Fargate(f) => assert_eq!(f.profiles.len(), 3),
                other => panic!("unexpected capacity {:?}", other),
            },
            other => panic!("unexpected config {:?}", other),
        }

        let karpenter = load_stack_file(demos.join("karpenter.kdl")).unwrap();
        let names: Vec<&str> = karpenter
            .stacks
            .deploy_order("CdkEksKarpenterStack")
            .unwrap()
            .into_iter()
            .map(|s| s.name())
            .collect();
        assert_eq!(names, vec!["K8sDeployPipelineStack", "CdkEksKarpenterStack"]);

        let chain = order(&karpenter, "CdkEksKarpenterStack");
        let position = |name: &str| chain.iter().position(|n| n == name).unwrap();
        let expected = [
            "karpenter-eks-cluster",
            "KarpenterNamespace",
            "KarpenterServiceAccount",
            "KarpenterControllerPolicy",
            "KarpenterHelmChart",
            "KarpenterEC2NodeClass",
            "KarpenterNodePool",
        ];
        for pair in expected.windows(2) {
            assert!(
                position(pair[0]) < position(pair[1]),
                "{} before {} in {:?}",
                pair[0],
                pair[1],
                chain
            );
        }

        let cluster = karpenter.stacks.get("CdkEksKarpenterStack").unwrap().graph();
        let mapping = cluster.node_by_name("KarpenterRoleMapping").unwrap();
        assert_eq!(mapping.bindings().len(), 1);
        assert_eq!(
            cluster.upstream_refs().map(|o| o.to_string()).collect::<Vec<_>>(),
            vec!["K8sDeployPipelineStack.deployer-role-arn".to_string()]
        );
        match cluster.node_by_name("KarpenterEC2NodeClass").unwrap().config() {
            ResourceConfig::RawManifest(m) => {
                assert_eq!(m.body["kind"], "EC2NodeClass");
                assert_eq!(m.body["spec"]["role"], "KarpenterNodeRole-karpenter-eks-cluster");
            }
            other => panic!("unexpected config {:?}", other),
        }
        match cluster.node_by_name("KarpenterHelmChart").unwrap().config() {
            ResourceConfig::HelmRelease(h) => {
                assert_eq!(h.repository.as_deref(), Some("oci://public.ecr.aws/karpenter"));
                assert_eq!(h.values["serviceAccount"]["create"], false);
            }
            other => panic!("unexpected config {:?}", other),
        }
    }
}
