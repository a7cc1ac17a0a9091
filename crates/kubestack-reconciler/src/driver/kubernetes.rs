//! Kubernetes driver: namespaces, service accounts and raw manifests via
//! server-side apply.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::discovery::{self, Scope};
use kube::{Client, Resource};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use kubestack_core::resource::{NamespaceConfig, RawManifestConfig, ServiceAccountConfig};
use kubestack_core::{Attributes, ResourceConfig};

use super::{DriverContext, ResourceDriver};
use crate::error::{DriverError, DriverResult};

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "kubestack";

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const STACK_LABEL: &str = "kubestack.io/stack";

/// Kubernetes-based driver.
pub struct KubeDriver {
    client: OnceCell<Client>,
    /// How long to wait for an ingress to be given a load balancer address.
    address_timeout: Duration,
}

impl KubeDriver {
    /// Driver connecting with the default kubeconfig on first use.
    pub fn new(address_timeout: Duration) -> Self {
        Self {
            client: OnceCell::new(),
            address_timeout,
        }
    }

    pub fn with_client(client: Client, address_timeout: Duration) -> Self {
        Self {
            client: OnceCell::new_with(Some(client)),
            address_timeout,
        }
    }

    async fn client(&self) -> DriverResult<Client> {
        let client = self
            .client
            .get_or_try_init(|| async { Client::try_default().await })
            .await?;
        Ok(client.clone())
    }

    fn params() -> PatchParams {
        PatchParams::apply(FIELD_MANAGER).force()
    }

    async fn apply_namespace(
        &self,
        ctx: &DriverContext,
        config: &NamespaceConfig,
    ) -> DriverResult<Attributes> {
        let api: Api<Namespace> = Api::all(self.client().await?);
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(config.name.clone()),
                labels: Some(stack_labels(ctx, &config.labels)),
                ..Default::default()
            },
            ..Default::default()
        };
        let applied = api
            .patch(&config.name, &Self::params(), &Patch::Apply(&ns))
            .await?;
        Ok(meta_attributes(applied.meta()))
    }

    async fn apply_service_account(
        &self,
        ctx: &DriverContext,
        config: &ServiceAccountConfig,
    ) -> DriverResult<Attributes> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client().await?, &config.namespace);
        let sa = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(config.name.clone()),
                namespace: Some(config.namespace.clone()),
                labels: Some(stack_labels(ctx, &config.labels)),
                annotations: (!config.annotations.is_empty()).then(|| config.annotations.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        let applied = api
            .patch(&config.name, &Self::params(), &Patch::Apply(&sa))
            .await?;
        Ok(meta_attributes(applied.meta()))
    }

    /// Api handle for an untyped manifest, scoped the way the server says.
    async fn dynamic_api(&self, manifest: &RawManifestConfig) -> DriverResult<(Api<DynamicObject>, String)> {
        let api_version = manifest
            .api_version()
            .ok_or_else(|| DriverError::InvalidManifest("missing apiVersion".to_string()))?;
        let kind = manifest
            .manifest_kind()
            .ok_or_else(|| DriverError::InvalidManifest("missing kind".to_string()))?;
        let name = manifest
            .name()
            .ok_or_else(|| DriverError::InvalidManifest("missing metadata.name".to_string()))?;

        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", api_version),
        };
        let gvk = GroupVersionKind::gvk(group, version, kind);

        let client = self.client().await?;
        let (resource, capabilities) = discovery::pinned_kind(&client, &gvk).await?;
        let api = match (capabilities.scope, manifest.namespace()) {
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(client, ns, &resource),
            (Scope::Namespaced, None) => Api::default_namespaced_with(client, &resource),
            (Scope::Cluster, _) => Api::all_with(client, &resource),
        };
        Ok((api, name.to_string()))
    }

    async fn apply_manifest(
        &self,
        ctx: &DriverContext,
        manifest: &RawManifestConfig,
    ) -> DriverResult<Attributes> {
        let (api, name) = self.dynamic_api(manifest).await?;

        let mut body = manifest.body.clone();
        let existing: BTreeMap<String, String> = body
            .pointer("/metadata/labels")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        if let Some(metadata) = body.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.insert("labels".to_string(), json!(stack_labels(ctx, &existing)));
        }

        let applied = api.patch(&name, &Self::params(), &Patch::Apply(&body)).await?;
        let mut attributes = meta_attributes(&applied.metadata);
        if let Some(kind) = manifest.manifest_kind() {
            attributes.insert("kind".to_string(), json!(kind));
        }

        if manifest.manifest_kind() == Some("Ingress") {
            let address = self.wait_for_address(&api, &name, applied).await?;
            attributes.insert("load_balancer_hostname".to_string(), json!(address));
        }
        Ok(attributes)
    }

    /// Poll an ingress until the controller publishes its load balancer
    /// address.
    async fn wait_for_address(
        &self,
        api: &Api<DynamicObject>,
        name: &str,
        mut current: DynamicObject,
    ) -> DriverResult<String> {
        let poll = async {
            loop {
                if let Some(address) = ingress_address(&current.data) {
                    return Ok::<_, DriverError>(address);
                }
                debug!(ingress = %name, "Waiting for load balancer address");
                tokio::time::sleep(Duration::from_secs(5)).await;
                current = api.get(name).await?;
            }
        };
        tokio::time::timeout(self.address_timeout, poll)
            .await
            .map_err(|_| DriverError::Timeout {
                program: format!("ingress {}", name),
                timeout: self.address_timeout,
            })?
    }
}

#[async_trait]
impl ResourceDriver for KubeDriver {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn apply(
        &self,
        ctx: &DriverContext,
        node: &str,
        config: &ResourceConfig,
    ) -> DriverResult<Attributes> {
        info!(stack = %ctx.stack, node = %node, kind = %config.kind(), "Applying");
        match config {
            ResourceConfig::Namespace(c) => self.apply_namespace(ctx, c).await,
            ResourceConfig::ServiceAccount(c) => self.apply_service_account(ctx, c).await,
            ResourceConfig::RawManifest(c) => self.apply_manifest(ctx, c).await,
            other => Err(DriverError::Unsupported {
                driver: self.name(),
                kind: other.kind(),
            }),
        }
    }

    async fn delete(
        &self,
        ctx: &DriverContext,
        node: &str,
        config: &ResourceConfig,
        _attributes: &Attributes,
    ) -> DriverResult<()> {
        info!(stack = %ctx.stack, node = %node, kind = %config.kind(), "Deleting");
        let params = DeleteParams::default();
        let result = match config {
            ResourceConfig::Namespace(c) => {
                let api: Api<Namespace> = Api::all(self.client().await?);
                api.delete(&c.name, &params).await.map(|_| ())
            }
            ResourceConfig::ServiceAccount(c) => {
                let api: Api<ServiceAccount> = Api::namespaced(self.client().await?, &c.namespace);
                api.delete(&c.name, &params).await.map(|_| ())
            }
            ResourceConfig::RawManifest(c) => {
                let (api, name) = self.dynamic_api(c).await?;
                api.delete(&name, &params).await.map(|_| ())
            }
            other => {
                return Err(DriverError::Unsupported {
                    driver: self.name(),
                    kind: other.kind(),
                });
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(node = %node, "Already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Labels of a managed object: the declared ones plus ownership labels.
fn stack_labels(ctx: &DriverContext, declared: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut labels = declared.clone();
    labels.insert(MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string());
    labels.insert(STACK_LABEL.to_string(), ctx.stack.clone());
    labels
}

fn meta_attributes(meta: &ObjectMeta) -> Attributes {
    let mut attributes = Attributes::new();
    for (key, value) in [
        ("name", &meta.name),
        ("namespace", &meta.namespace),
        ("uid", &meta.uid),
        ("resource_version", &meta.resource_version),
    ] {
        if let Some(value) = value {
            attributes.insert(key.to_string(), json!(value));
        }
    }
    attributes
}

/// First published hostname (or IP) of an ingress status.
fn ingress_address(data: &Value) -> Option<String> {
    let entry = data.pointer("/status/loadBalancer/ingress/0")?;
    entry
        .get("hostname")
        .or_else(|| entry.get("ip"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubestack_core::Environment;

    #[test]
    fn test_stack_labels_keep_declared_labels() {
        let ctx = DriverContext {
            stack: "FastApiService".to_string(),
            environment: Environment::new("532673134317", "eu-west-1").unwrap(),
            tags: BTreeMap::new(),
        };
        let declared = BTreeMap::from([("app".to_string(), "fastapi".to_string())]);
        let labels = stack_labels(&ctx, &declared);
        assert_eq!(labels["app"], "fastapi");
        assert_eq!(labels[STACK_LABEL], "FastApiService");
        assert_eq!(labels[MANAGED_BY_LABEL], "kubestack");
    }

    #[test]
    fn test_ingress_address() {
        let pending = json!({"status": {"loadBalancer": {}}});
        assert_eq!(ingress_address(&pending), None);

        let ready = json!({"status": {"loadBalancer": {"ingress": [
            {"hostname": "k8s-default-fastapi-123.eu-west-1.elb.amazonaws.com"}
        ]}}});
        assert_eq!(
            ingress_address(&ready).as_deref(),
            Some("k8s-default-fastapi-123.eu-west-1.elb.amazonaws.com")
        );
    }

    #[test]
    fn test_meta_attributes() {
        let meta = ObjectMeta {
            name: Some("fastapi".to_string()),
            namespace: Some("default".to_string()),
            uid: Some("abc".to_string()),
            ..Default::default()
        };
        let attrs = meta_attributes(&meta);
        assert_eq!(attrs["name"], "fastapi");
        assert_eq!(attrs["uid"], "abc");
        assert!(!attrs.contains_key("resource_version"));
    }
}
