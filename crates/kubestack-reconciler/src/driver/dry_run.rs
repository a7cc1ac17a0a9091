//! Driver that touches nothing: records calls and makes up plausible
//! attributes so bindings and outputs resolve.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::info;

use kubestack_core::resource::RecordType;
use kubestack_core::{Attributes, ResourceConfig, ResourceKind};

use super::{DriverContext, ResourceDriver};
use crate::error::{DriverError, DriverResult};

/// A call seen by the dry-run driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverCall {
    pub action: &'static str,
    pub stack: String,
    pub node: String,
    pub kind: ResourceKind,
}

#[derive(Debug, Default)]
pub struct DryRunDriver {
    calls: Mutex<Vec<DriverCall>>,
    fail_on: HashSet<String>,
}

impl DryRunDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call for the named node.
    pub fn failing_on(mut self, node: impl Into<String>) -> Self {
        self.fail_on.insert(node.into());
        self
    }

    /// Calls seen so far, in order.
    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    fn record(&self, action: &'static str, ctx: &DriverContext, node: &str, kind: ResourceKind) -> DriverResult<()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(DriverCall {
                action,
                stack: ctx.stack.clone(),
                node: node.to_string(),
                kind,
            });
        }
        if self.fail_on.contains(node) {
            return Err(DriverError::Injected(format!("{} {}", action, node)));
        }
        Ok(())
    }
}

/// Short stable hex id derived from the stack and node.
fn short_id(ctx: &DriverContext, node: &str, len: usize) -> String {
    let digest = Sha256::digest(format!("{}/{}/{}", ctx.environment.account, ctx.stack, node));
    let mut id = hex::encode(digest);
    id.truncate(len);
    id
}

fn synthesize(ctx: &DriverContext, node: &str, config: &ResourceConfig) -> Attributes {
    let region = &ctx.environment.region;
    let account = &ctx.environment.account;
    let mut attrs = Attributes::new();
    match config {
        ResourceConfig::Cluster(c) => {
            attrs.insert("name".into(), json!(node));
            attrs.insert("version".into(), json!(c.version));
            attrs.insert(
                "endpoint".into(),
                json!(format!(
                    "https://{}.gr7.{}.eks.amazonaws.com",
                    short_id(ctx, node, 32).to_uppercase(),
                    region
                )),
            );
            attrs.insert("vpc_id".into(), json!(format!("vpc-{}", short_id(ctx, node, 17))));
            attrs.insert(
                "security_group_id".into(),
                json!(format!("sg-{}", short_id(ctx, &format!("{}-sg", node), 17))),
            );
            attrs.insert(
                "oidc_provider_arn".into(),
                json!(format!(
                    "arn:aws:iam::{}:oidc-provider/oidc.eks.{}.amazonaws.com/id/{}",
                    account,
                    region,
                    short_id(ctx, node, 32).to_uppercase()
                )),
            );
        }
        ResourceConfig::Namespace(c) => {
            attrs.insert("name".into(), json!(c.name));
        }
        ResourceConfig::ServiceAccount(c) => {
            attrs.insert("name".into(), json!(c.name));
            attrs.insert("namespace".into(), json!(c.namespace));
            attrs.insert(
                "role_arn".into(),
                json!(format!("arn:aws:iam::{}:role/{}-{}", account, ctx.stack, node)),
            );
        }
        ResourceConfig::PolicyAttachment(c) => {
            let arn = c.managed_policy_arn.clone().unwrap_or_else(|| {
                format!(
                    "arn:aws:iam::{}:policy/{}",
                    account,
                    c.policy_name.as_deref().unwrap_or(node)
                )
            });
            attrs.insert("policy_arn".into(), json!(arn));
        }
        ResourceConfig::HelmRelease(c) => {
            attrs.insert("release".into(), json!(c.release_name()));
            attrs.insert("namespace".into(), json!(c.namespace));
            attrs.insert("chart".into(), json!(c.chart));
            attrs.insert("revision".into(), json!(1));
            attrs.insert("status".into(), json!("deployed"));
        }
        ResourceConfig::RawManifest(c) => {
            if let Some(name) = c.name() {
                attrs.insert("name".into(), json!(name));
            }
            if let Some(namespace) = c.namespace() {
                attrs.insert("namespace".into(), json!(namespace));
            }
            if let Some(kind) = c.manifest_kind() {
                attrs.insert("kind".into(), json!(kind));
            }
            if c.manifest_kind() == Some("Ingress") {
                attrs.insert(
                    "load_balancer_hostname".into(),
                    json!(format!(
                        "k8s-{}-{}-{}.{}.elb.amazonaws.com",
                        c.namespace().unwrap_or("default"),
                        c.name().unwrap_or(node),
                        short_id(ctx, node, 10),
                        region
                    )),
                );
            }
        }
        ResourceConfig::DnsRecord(c) => {
            attrs.insert("fqdn".into(), json!(c.fqdn()));
            attrs.insert(
                "type".into(),
                json!(match c.record_type {
                    RecordType::Cname => "CNAME",
                    RecordType::A => "A",
                }),
            );
            if let Some(target) = &c.target {
                attrs.insert("target".into(), json!(target));
            }
        }
    }
    attrs
}

#[async_trait]
impl ResourceDriver for DryRunDriver {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    async fn apply(
        &self,
        ctx: &DriverContext,
        node: &str,
        config: &ResourceConfig,
    ) -> DriverResult<Attributes> {
        self.record("apply", ctx, node, config.kind())?;
        info!(stack = %ctx.stack, node = %node, kind = %config.kind(), "Would apply");
        Ok(synthesize(ctx, node, config))
    }

    async fn delete(
        &self,
        ctx: &DriverContext,
        node: &str,
        config: &ResourceConfig,
        _attributes: &Attributes,
    ) -> DriverResult<()> {
        self.record("delete", ctx, node, config.kind())?;
        info!(stack = %ctx.stack, node = %node, kind = %config.kind(), "Would delete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubestack_core::Environment;
    use kubestack_core::resource::RawManifestConfig;
    use std::collections::BTreeMap;

    fn ctx() -> DriverContext {
        DriverContext {
            stack: "FastApiService".to_string(),
            environment: Environment::new("532673134317", "eu-west-1").unwrap(),
            tags: BTreeMap::new(),
        }
    }

    fn ingress() -> ResourceConfig {
        ResourceConfig::RawManifest(RawManifestConfig {
            body: json!({
                "apiVersion": "networking.k8s.io/v1",
                "kind": "Ingress",
                "metadata": {"name": "fastapi-ingress", "namespace": "default"}
            }),
        })
    }

    #[tokio::test]
    async fn test_ingress_gets_a_load_balancer_hostname() {
        let driver = DryRunDriver::new();
        let first = driver.apply(&ctx(), "Ingress", &ingress()).await.unwrap();
        let second = driver.apply(&ctx(), "Ingress", &ingress()).await.unwrap();
        assert_eq!(first, second);
        let hostname = first["load_balancer_hostname"].as_str().unwrap();
        assert!(hostname.starts_with("k8s-default-fastapi-ingress-"));
        assert!(hostname.ends_with(".eu-west-1.elb.amazonaws.com"));
        assert_eq!(driver.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_injected_failure_is_recorded() {
        let driver = DryRunDriver::new().failing_on("Ingress");
        let err = driver.apply(&ctx(), "Ingress", &ingress()).await.unwrap_err();
        assert!(matches!(err, DriverError::Injected(_)));
        assert_eq!(
            driver.calls(),
            vec![DriverCall {
                action: "apply",
                stack: "FastApiService".to_string(),
                node: "Ingress".to_string(),
                kind: ResourceKind::RawManifest,
            }]
        );
    }
}
