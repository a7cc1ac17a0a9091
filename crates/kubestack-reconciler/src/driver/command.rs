//! Delegates cloud resources (cluster, policy attachments, DNS records) to an
//! external provisioner executable.
//!
//! Protocol: `<program> apply|delete <kind> <node>`, a JSON request on stdin
//! and, for `apply`, a JSON object of attributes on stdout. A non-zero exit
//! fails the node with the program's stderr.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::info;

use kubestack_core::{Attributes, ResourceConfig};

use super::{DriverContext, ResourceDriver, parse_attributes, run_process};
use crate::error::{DriverError, DriverResult};

/// Runs an external provisioner.
pub struct CommandDriver {
    program: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct Request<'a> {
    #[serde(flatten)]
    ctx: &'a DriverContext,
    node: &'a str,
    config: &'a ResourceConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    attributes: Option<&'a Attributes>,
}

impl CommandDriver {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    async fn call(
        &self,
        action: &str,
        request: &Request<'_>,
    ) -> DriverResult<String> {
        let args = vec![
            action.to_string(),
            request.config.kind().to_string(),
            request.node.to_string(),
        ];
        let stdin = serde_json::to_vec(request)
            .map_err(|e| DriverError::InvalidOutput(format!("provisioner request: {}", e)))?;
        run_process(&self.program, &args, Some(stdin), self.timeout).await
    }
}

#[async_trait]
impl ResourceDriver for CommandDriver {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn apply(
        &self,
        ctx: &DriverContext,
        node: &str,
        config: &ResourceConfig,
    ) -> DriverResult<Attributes> {
        info!(stack = %ctx.stack, node = %node, kind = %config.kind(), program = %self.program, "Provisioning");
        let request = Request {
            ctx,
            node,
            config,
            attributes: None,
        };
        let stdout = self.call("apply", &request).await?;
        parse_attributes(&stdout)
    }

    async fn delete(
        &self,
        ctx: &DriverContext,
        node: &str,
        config: &ResourceConfig,
        attributes: &Attributes,
    ) -> DriverResult<()> {
        info!(stack = %ctx.stack, node = %node, kind = %config.kind(), program = %self.program, "Deprovisioning");
        let request = Request {
            ctx,
            node,
            config,
            attributes: Some(attributes),
        };
        self.call("delete", &request).await?;
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use kubestack_core::Environment;
    use kubestack_core::resource::{DnsRecordConfig, RecordType};
    use std::collections::BTreeMap;
    use std::os::unix::fs::PermissionsExt;

    fn ctx() -> DriverContext {
        DriverContext {
            stack: "FastApiService".to_string(),
            environment: Environment::new("532673134317", "eu-west-1").unwrap(),
            tags: BTreeMap::from([("project".to_string(), "fastapi-eks".to_string())]),
        }
    }

    fn record() -> ResourceConfig {
        ResourceConfig::DnsRecord(DnsRecordConfig {
            zone: "piercuta.com".to_string(),
            record_name: "my-fastapi".to_string(),
            record_type: RecordType::Cname,
            target: Some("k8s-default-fastapi.eu-west-1.elb.amazonaws.com".to_string()),
            ttl_seconds: 300,
        })
    }

    /// Write an executable provisioner script running `body`.
    fn script(dir: &std::path::Path, body: &str) -> String {
        let path = dir.join("provisioner");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn test_apply_passes_request_and_reads_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(
            dir.path(),
            r#"input=$(cat)
case "$input" in *'"account":"532673134317"'*) ok=yes ;; *) ok=no ;; esac
printf '{"action": "%s", "kind": "%s", "node": "%s", "saw_env": "%s"}' "$1" "$2" "$3" "$ok""#,
        );
        let driver = CommandDriver::new(program, Duration::from_secs(10));
        let attrs = driver.apply(&ctx(), "Record", &record()).await.unwrap();
        assert_eq!(attrs["action"], "apply");
        assert_eq!(attrs["kind"], "dns-record");
        assert_eq!(attrs["node"], "Record");
        assert_eq!(attrs["saw_env"], "yes");
    }

    #[tokio::test]
    async fn test_failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "cat >/dev/null\necho 'zone piercuta.com not found' >&2\nexit 1");
        let driver = CommandDriver::new(program, Duration::from_secs(10));
        let err = driver.apply(&ctx(), "Record", &record()).await.unwrap_err();
        assert!(err.to_string().contains("zone piercuta.com not found"));

        let err = driver
            .delete(&ctx(), "Record", &record(), &Attributes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::CommandFailed { .. }));
    }
}
