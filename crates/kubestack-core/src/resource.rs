//! Resource kinds and their configuration schemas.
//!
//! Every node carries one [`ResourceConfig`] variant. Variants are validated
//! when the node is added so that malformed configuration is rejected before
//! anything is sent to a reconciler.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// The kind of a resource node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Cluster,
    Namespace,
    ServiceAccount,
    PolicyAttachment,
    HelmRelease,
    RawManifest,
    DnsRecord,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 7] = [
        ResourceKind::Cluster,
        ResourceKind::Namespace,
        ResourceKind::ServiceAccount,
        ResourceKind::PolicyAttachment,
        ResourceKind::HelmRelease,
        ResourceKind::RawManifest,
        ResourceKind::DnsRecord,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cluster => "cluster",
            ResourceKind::Namespace => "namespace",
            ResourceKind::ServiceAccount => "service-account",
            ResourceKind::PolicyAttachment => "policy-attachment",
            ResourceKind::HelmRelease => "helm-release",
            ResourceKind::RawManifest => "raw-manifest",
            ResourceKind::DnsRecord => "dns-record",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown resource kind: {}", s))
    }
}

/// Kind-specific configuration of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ResourceConfig {
    Cluster(ClusterConfig),
    Namespace(NamespaceConfig),
    ServiceAccount(ServiceAccountConfig),
    PolicyAttachment(PolicyAttachmentConfig),
    HelmRelease(HelmReleaseConfig),
    RawManifest(RawManifestConfig),
    DnsRecord(DnsRecordConfig),
}

impl ResourceConfig {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceConfig::Cluster(_) => ResourceKind::Cluster,
            ResourceConfig::Namespace(_) => ResourceKind::Namespace,
            ResourceConfig::ServiceAccount(_) => ResourceKind::ServiceAccount,
            ResourceConfig::PolicyAttachment(_) => ResourceKind::PolicyAttachment,
            ResourceConfig::HelmRelease(_) => ResourceKind::HelmRelease,
            ResourceConfig::RawManifest(_) => ResourceKind::RawManifest,
            ResourceConfig::DnsRecord(_) => ResourceKind::DnsRecord,
        }
    }

    /// Check the fields required for this kind. `node` names the node in
    /// error messages.
    pub fn validate(&self, node: &str) -> Result<()> {
        match self {
            ResourceConfig::Cluster(c) => c.validate(node),
            ResourceConfig::Namespace(c) => c.validate(node),
            ResourceConfig::ServiceAccount(c) => c.validate(node),
            ResourceConfig::PolicyAttachment(c) => c.validate(node),
            ResourceConfig::HelmRelease(c) => c.validate(node),
            ResourceConfig::RawManifest(c) => c.validate(node),
            ResourceConfig::DnsRecord(c) => c.validate(node),
        }
    }

    /// JSON pointers of required fields that may be left empty at
    /// declaration time, provided a binding fills them before apply.
    pub fn deferred_fields(&self) -> Vec<&'static str> {
        match self {
            ResourceConfig::DnsRecord(c) if c.target.is_none() => vec!["/target"],
            _ => Vec::new(),
        }
    }

    /// Names of other nodes this config refers to. The builder turns each one
    /// into a dependency edge.
    pub fn references(&self) -> Vec<(&str, ResourceKind)> {
        match self {
            ResourceConfig::PolicyAttachment(c) => {
                vec![(c.service_account.as_str(), ResourceKind::ServiceAccount)]
            }
            _ => Vec::new(),
        }
    }

    /// Write `value` at `pointer` and return the re-validated config.
    pub fn with_value_at(&self, node: &str, pointer: &str, value: Value) -> Result<ResourceConfig> {
        let mut doc = serde_json::to_value(self)
            .map_err(|e| Error::Internal(format!("serialize config for '{}': {}", node, e)))?;
        set_pointer(&mut doc, pointer, value)
            .map_err(|message| Error::invalid(node, message))?;
        let config: ResourceConfig = serde_json::from_value(doc)
            .map_err(|e| Error::invalid(node, format!("binding at '{}' breaks config: {}", pointer, e)))?;
        if config.kind() != self.kind() {
            return Err(Error::invalid(node, format!("binding at '{}' changes the kind", pointer)));
        }
        config.validate(node)?;
        Ok(config)
    }
}

/// Check that `pointer` is a usable JSON pointer for a binding.
pub fn validate_pointer(pointer: &str) -> std::result::Result<(), String> {
    if !pointer.starts_with('/') || pointer.len() < 2 {
        return Err(format!("'{}' is not a JSON pointer", pointer));
    }
    if pointer == "/kind" {
        return Err("the kind tag cannot be bound".to_string());
    }
    Ok(())
}

/// Set `value` at `pointer`, creating intermediate objects as needed.
fn set_pointer(doc: &mut Value, pointer: &str, value: Value) -> std::result::Result<(), String> {
    validate_pointer(pointer)?;
    let tokens: Vec<String> = pointer[1..]
        .split('/')
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect();
    let (last, parents) = tokens
        .split_last()
        .ok_or_else(|| format!("'{}' is not a JSON pointer", pointer))?;

    let mut cursor = doc;
    for token in parents {
        cursor = match cursor {
            Value::Object(map) => map
                .entry(token.clone())
                .or_insert_with(|| Value::Object(Default::default())),
            Value::Array(items) => {
                let index: usize = token
                    .parse()
                    .map_err(|_| format!("'{}' is not an array index in '{}'", token, pointer))?;
                items
                    .get_mut(index)
                    .ok_or_else(|| format!("index {} out of bounds in '{}'", index, pointer))?
            }
            _ => return Err(format!("'{}' does not address a container", pointer)),
        };
        if cursor.is_null() {
            *cursor = Value::Object(Default::default());
        }
    }

    match cursor {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index: usize = last
                .parse()
                .map_err(|_| format!("'{}' is not an array index in '{}'", last, pointer))?;
            let slot = items
                .get_mut(index)
                .ok_or_else(|| format!("index {} out of bounds in '{}'", index, pointer))?;
            *slot = value;
            Ok(())
        }
        _ => Err(format!("'{}' does not address a container", pointer)),
    }
}

/// RFC 1123 label: lowercase alphanumerics and '-', at most 63 chars.
pub fn is_dns1123_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

/// RFC 1123 subdomain: dot separated labels, at most 253 chars.
pub fn is_dns1123_subdomain(s: &str) -> bool {
    !s.is_empty() && s.len() <= 253 && s.split('.').all(is_dns1123_label)
}

fn require(node: &str, field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::invalid(node, format!("missing required field '{}'", field)));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Cluster

/// Managed Kubernetes cluster together with its network and capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Kubernetes version (e.g., "1.32").
    pub version: String,
    #[serde(default)]
    pub vpc: VpcConfig,
    #[serde(default)]
    pub capacity: Capacity,
    /// Control plane log types shipped to the provider's log service.
    #[serde(default)]
    pub logging: Vec<ControlPlaneLog>,
    /// IAM roles mapped into the cluster's RBAC.
    #[serde(default)]
    pub admin_roles: Vec<RoleMapping>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ClusterConfig {
    fn validate(&self, node: &str) -> Result<()> {
        require(node, "version", &self.version)?;
        let valid_version = self
            .version
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()));
        if !valid_version {
            return Err(Error::invalid(
                node,
                format!("'{}' is not a Kubernetes version", self.version),
            ));
        }
        if self.vpc.max_azs == 0 {
            return Err(Error::invalid(node, "vpc max_azs must be at least 1"));
        }
        self.capacity.validate(node)?;
        for role in &self.admin_roles {
            if !role.arn.starts_with("arn:") {
                return Err(Error::invalid(node, format!("'{}' is not an ARN", role.arn)));
            }
            if role.groups.is_empty() {
                return Err(Error::invalid(
                    node,
                    format!("role mapping for '{}' has no groups", role.arn),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpcConfig {
    pub max_azs: u8,
    pub nat_gateways: Option<u8>,
}

impl Default for VpcConfig {
    fn default() -> Self {
        Self {
            max_azs: 2,
            nat_gateways: None,
        }
    }
}

/// How worker capacity is provided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Capacity {
    /// Managed node group of EC2-style instances.
    NodeGroup(NodeGroupCapacity),
    /// Serverless pods selected by namespace.
    Fargate(FargateCapacity),
}

impl Default for Capacity {
    fn default() -> Self {
        Capacity::NodeGroup(NodeGroupCapacity::default())
    }
}

impl Capacity {
    fn validate(&self, node: &str) -> Result<()> {
        match self {
            Capacity::NodeGroup(ng) => {
                require(node, "instance_type", &ng.instance_type)?;
                if ng.min > ng.desired || ng.desired > ng.max {
                    return Err(Error::invalid(
                        node,
                        format!(
                            "node group sizes must satisfy min <= desired <= max (got {} / {} / {})",
                            ng.min, ng.desired, ng.max
                        ),
                    ));
                }
                Ok(())
            }
            Capacity::Fargate(f) => {
                if f.profiles.is_empty() {
                    return Err(Error::invalid(node, "fargate capacity needs at least one profile"));
                }
                for profile in &f.profiles {
                    require(node, "profile name", &profile.name)?;
                    if profile.namespaces.is_empty() {
                        return Err(Error::invalid(
                            node,
                            format!("fargate profile '{}' selects no namespace", profile.name),
                        ));
                    }
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeGroupCapacity {
    pub instance_type: String,
    pub desired: u32,
    pub min: u32,
    pub max: u32,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Default for NodeGroupCapacity {
    fn default() -> Self {
        Self {
            instance_type: "m5.xlarge".to_string(),
            desired: 1,
            min: 1,
            max: 1,
            labels: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FargateCapacity {
    pub profiles: Vec<FargateProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FargateProfile {
    pub name: String,
    pub namespaces: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ControlPlaneLog {
    Api,
    Audit,
    Authenticator,
    ControllerManager,
    Scheduler,
}

impl std::str::FromStr for ControlPlaneLog {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "api" => Ok(ControlPlaneLog::Api),
            "audit" => Ok(ControlPlaneLog::Audit),
            "authenticator" => Ok(ControlPlaneLog::Authenticator),
            "controllerManager" | "controller-manager" => Ok(ControlPlaneLog::ControllerManager),
            "scheduler" => Ok(ControlPlaneLog::Scheduler),
            _ => Err(format!("unknown control plane log type: {}", s)),
        }
    }
}

/// An IAM role granted access to the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleMapping {
    pub arn: String,
    pub username: Option<String>,
    pub groups: Vec<String>,
}

// ---------------------------------------------------------------------------
// In-cluster identities

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl NamespaceConfig {
    fn validate(&self, node: &str) -> Result<()> {
        require(node, "name", &self.name)?;
        if !is_dns1123_label(&self.name) {
            return Err(Error::invalid(
                node,
                format!("namespace '{}' is not a DNS-1123 label", self.name),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceAccountConfig {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl ServiceAccountConfig {
    fn validate(&self, node: &str) -> Result<()> {
        require(node, "name", &self.name)?;
        require(node, "namespace", &self.namespace)?;
        if !is_dns1123_subdomain(&self.name) {
            return Err(Error::invalid(
                node,
                format!("service account '{}' is not a DNS-1123 subdomain", self.name),
            ));
        }
        if !is_dns1123_label(&self.namespace) {
            return Err(Error::invalid(
                node,
                format!("namespace '{}' is not a DNS-1123 label", self.namespace),
            ));
        }
        Ok(())
    }
}

/// IAM permissions attached to the role behind a service account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyAttachmentConfig {
    /// Name of the service-account node whose role receives the policy.
    pub service_account: String,
    pub policy_name: Option<String>,
    /// Inline IAM policy document.
    pub document: Option<Value>,
    pub managed_policy_arn: Option<String>,
}

impl PolicyAttachmentConfig {
    fn validate(&self, node: &str) -> Result<()> {
        require(node, "service_account", &self.service_account)?;
        match (&self.document, &self.managed_policy_arn) {
            (Some(_), Some(_)) => Err(Error::invalid(
                node,
                "set either an inline document or a managed policy ARN, not both",
            )),
            (None, None) => Err(Error::invalid(
                node,
                "missing required field 'document' or 'managed_policy_arn'",
            )),
            (None, Some(arn)) if !arn.starts_with("arn:") => {
                Err(Error::invalid(node, format!("'{}' is not an ARN", arn)))
            }
            (None, Some(_)) => Ok(()),
            (Some(doc), None) => validate_policy_document(node, doc),
        }
    }
}

fn validate_policy_document(node: &str, doc: &Value) -> Result<()> {
    let statements = doc
        .get("Statement")
        .ok_or_else(|| Error::invalid(node, "policy document has no 'Statement'"))?;
    let statements: Vec<&Value> = match statements {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![statements],
        _ => return Err(Error::invalid(node, "policy 'Statement' must be a list or object")),
    };
    if statements.is_empty() {
        return Err(Error::invalid(node, "policy document has no statements"));
    }
    for statement in statements {
        match statement.get("Effect").and_then(Value::as_str) {
            Some("Allow") | Some("Deny") => {}
            _ => {
                return Err(Error::invalid(
                    node,
                    "every policy statement needs an Effect of Allow or Deny",
                ));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Packages and manifests

/// A chart release installed through the package manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelmReleaseConfig {
    pub chart: String,
    pub namespace: String,
    pub repository: Option<String>,
    /// Release name; defaults to the chart name.
    pub release: Option<String>,
    pub version: Option<String>,
    #[serde(default = "empty_object")]
    pub values: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl HelmReleaseConfig {
    pub fn release_name(&self) -> &str {
        self.release.as_deref().unwrap_or(&self.chart)
    }

    fn validate(&self, node: &str) -> Result<()> {
        require(node, "chart", &self.chart)?;
        require(node, "namespace", &self.namespace)?;
        if !is_dns1123_label(&self.namespace) {
            return Err(Error::invalid(
                node,
                format!("namespace '{}' is not a DNS-1123 label", self.namespace),
            ));
        }
        let release = self.release_name();
        if release.len() > 53 || !is_dns1123_subdomain(release) {
            return Err(Error::invalid(
                node,
                format!("release name '{}' is not valid", release),
            ));
        }
        if let Some(repo) = &self.repository {
            let supported = ["https://", "http://", "oci://"];
            if !supported.iter().any(|scheme| repo.starts_with(scheme)) {
                return Err(Error::invalid(
                    node,
                    format!("repository '{}' is not an http(s) or oci URL", repo),
                ));
            }
        }
        if !self.values.is_object() {
            return Err(Error::invalid(node, "chart values must be a mapping"));
        }
        Ok(())
    }
}

/// A raw Kubernetes manifest submitted as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawManifestConfig {
    pub body: Value,
}

impl RawManifestConfig {
    pub fn api_version(&self) -> Option<&str> {
        self.body.get("apiVersion").and_then(Value::as_str)
    }

    pub fn manifest_kind(&self) -> Option<&str> {
        self.body.get("kind").and_then(Value::as_str)
    }

    pub fn name(&self) -> Option<&str> {
        self.body.pointer("/metadata/name").and_then(Value::as_str)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.body.pointer("/metadata/namespace").and_then(Value::as_str)
    }

    fn validate(&self, node: &str) -> Result<()> {
        if !self.body.is_object() {
            return Err(Error::invalid(node, "manifest body must be a mapping"));
        }
        for (field, value) in [
            ("apiVersion", self.api_version()),
            ("kind", self.manifest_kind()),
            ("metadata.name", self.name()),
        ] {
            match value {
                Some(v) if !v.trim().is_empty() => {}
                _ => {
                    return Err(Error::invalid(
                        node,
                        format!("manifest is missing '{}'", field),
                    ));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DNS

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    #[default]
    Cname,
    A,
}

/// A record in a hosted zone, typically pointing at a load balancer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsRecordConfig {
    pub zone: String,
    pub record_name: String,
    #[serde(default)]
    pub record_type: RecordType,
    /// Left empty when bound to another node's attribute.
    pub target: Option<String>,
    #[serde(default = "default_ttl")]
    pub ttl_seconds: u32,
}

fn default_ttl() -> u32 {
    300
}

impl DnsRecordConfig {
    /// Fully qualified record name.
    pub fn fqdn(&self) -> String {
        format!("{}.{}", self.record_name, self.zone)
    }

    fn validate(&self, node: &str) -> Result<()> {
        require(node, "zone", &self.zone)?;
        require(node, "record_name", &self.record_name)?;
        if self.ttl_seconds == 0 {
            return Err(Error::invalid(node, "ttl must be positive"));
        }
        if let Some(target) = &self.target {
            require(node, "target", target)?;
            if self.record_type == RecordType::A && target.parse::<std::net::Ipv4Addr>().is_err() {
                return Err(Error::invalid(
                    node,
                    format!("A record target '{}' is not an IPv4 address", target),
                ));
            }
        }
        Ok(())
    }
}
