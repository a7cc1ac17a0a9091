//! Helm driver: chart releases through the `helm` binary.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info};

use kubestack_core::resource::HelmReleaseConfig;
use kubestack_core::{Attributes, ResourceConfig};

use super::{DriverContext, ResourceDriver, run_process};
use crate::error::{DriverError, DriverResult};

/// Runs `helm upgrade --install` and `helm uninstall`.
pub struct HelmDriver {
    /// Path to helm binary
    helm_bin: String,
    timeout: Duration,
}

impl HelmDriver {
    pub fn new(helm_bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            helm_bin: helm_bin.into(),
            timeout,
        }
    }

    /// Arguments of the install-or-upgrade call. Values come on stdin.
    fn upgrade_args(&self, config: &HelmReleaseConfig) -> Vec<String> {
        let mut args = vec![
            "upgrade".to_string(),
            "--install".to_string(),
            config.release_name().to_string(),
        ];
        match config.repository.as_deref() {
            Some(repo) if repo.starts_with("oci://") => {
                args.push(format!("{}/{}", repo.trim_end_matches('/'), config.chart));
            }
            Some(repo) => {
                args.push(config.chart.clone());
                args.push("--repo".to_string());
                args.push(repo.to_string());
            }
            None => args.push(config.chart.clone()),
        }
        args.extend([
            "--namespace".to_string(),
            config.namespace.clone(),
            "--create-namespace".to_string(),
        ]);
        if let Some(version) = &config.version {
            args.push("--version".to_string());
            args.push(version.clone());
        }
        args.extend([
            "--values".to_string(),
            "-".to_string(),
            "--wait".to_string(),
            "--timeout".to_string(),
            format!("{}s", self.timeout.as_secs()),
            "--output".to_string(),
            "json".to_string(),
        ]);
        args
    }
}

/// Attributes of a release from `helm ... --output json`.
fn release_attributes(config: &HelmReleaseConfig, stdout: &str) -> DriverResult<Attributes> {
    let release: Value = serde_json::from_str(stdout.trim())
        .map_err(|e| DriverError::InvalidOutput(format!("helm release JSON: {}", e)))?;

    let mut attributes = Attributes::new();
    attributes.insert("release".to_string(), json!(config.release_name()));
    attributes.insert("namespace".to_string(), json!(config.namespace));
    attributes.insert("chart".to_string(), json!(config.chart));
    if let Some(revision) = release.get("version") {
        attributes.insert("revision".to_string(), revision.clone());
    }
    if let Some(status) = release.pointer("/info/status") {
        attributes.insert("status".to_string(), status.clone());
    }
    if let Some(version) = release.pointer("/chart/metadata/version") {
        attributes.insert("chart_version".to_string(), version.clone());
    }
    Ok(attributes)
}

#[async_trait]
impl ResourceDriver for HelmDriver {
    fn name(&self) -> &'static str {
        "helm"
    }

    async fn apply(
        &self,
        ctx: &DriverContext,
        node: &str,
        config: &ResourceConfig,
    ) -> DriverResult<Attributes> {
        let ResourceConfig::HelmRelease(release) = config else {
            return Err(DriverError::Unsupported {
                driver: self.name(),
                kind: config.kind(),
            });
        };
        info!(
            stack = %ctx.stack,
            node = %node,
            release = %release.release_name(),
            chart = %release.chart,
            "Running helm upgrade --install"
        );

        let values = serde_json::to_vec(&release.values)
            .map_err(|e| DriverError::InvalidOutput(format!("chart values: {}", e)))?;
        let stdout = run_process(
            &self.helm_bin,
            &self.upgrade_args(release),
            Some(values),
            // helm enforces --timeout itself; leave it room to report
            self.timeout + Duration::from_secs(30),
        )
        .await?;
        release_attributes(release, &stdout)
    }

    async fn delete(
        &self,
        ctx: &DriverContext,
        node: &str,
        config: &ResourceConfig,
        _attributes: &Attributes,
    ) -> DriverResult<()> {
        let ResourceConfig::HelmRelease(release) = config else {
            return Err(DriverError::Unsupported {
                driver: self.name(),
                kind: config.kind(),
            });
        };
        info!(stack = %ctx.stack, node = %node, release = %release.release_name(), "Running helm uninstall");

        let args = vec![
            "uninstall".to_string(),
            release.release_name().to_string(),
            "--namespace".to_string(),
            release.namespace.clone(),
            "--wait".to_string(),
        ];
        match run_process(&self.helm_bin, &args, None, self.timeout).await {
            Ok(_) => Ok(()),
            Err(DriverError::CommandFailed { stderr, .. }) if stderr.contains("not found") => {
                debug!(node = %node, "Release already uninstalled");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
