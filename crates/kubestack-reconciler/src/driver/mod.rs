//! Per-kind drivers: the boundary to the systems that actually hold the
//! resources (cloud provisioner, Kubernetes API, package manager).

mod command;
mod dry_run;
mod helm;
mod kubernetes;

pub use command::CommandDriver;
pub use dry_run::{DriverCall, DryRunDriver};
pub use helm::HelmDriver;
pub use kubernetes::KubeDriver;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use kubestack_core::{Attributes, Environment, ResourceConfig, ResourceKind};

use crate::error::{DriverError, DriverResult};

/// Stack-level facts every driver call gets.
#[derive(Debug, Clone, Serialize)]
pub struct DriverContext {
    pub stack: String,
    pub environment: Environment,
    pub tags: BTreeMap<String, String>,
}

/// Converges one kind of resource.
#[async_trait]
pub trait ResourceDriver: Send + Sync {
    /// Name of this driver.
    fn name(&self) -> &'static str;

    /// Create or update the resource and report its attributes.
    async fn apply(
        &self,
        ctx: &DriverContext,
        node: &str,
        config: &ResourceConfig,
    ) -> DriverResult<Attributes>;

    /// Delete the resource last applied with `config`. Deleting something
    /// that is already gone succeeds.
    async fn delete(
        &self,
        ctx: &DriverContext,
        node: &str,
        config: &ResourceConfig,
        attributes: &Attributes,
    ) -> DriverResult<()>;
}

/// Driver registry keyed by resource kind.
#[derive(Clone, Default)]
pub struct DriverSet {
    drivers: HashMap<ResourceKind, Arc<dyn ResourceDriver>>,
}

impl std::fmt::Debug for DriverSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<(&str, &str)> = self
            .drivers
            .iter()
            .map(|(kind, driver)| (kind.as_str(), driver.name()))
            .collect();
        kinds.sort();
        f.debug_struct("DriverSet").field("drivers", &kinds).finish()
    }
}

impl DriverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ResourceKind, driver: Arc<dyn ResourceDriver>) -> &mut Self {
        self.drivers.insert(kind, driver);
        self
    }

    /// Register `driver` for every kind in `kinds`.
    pub fn register_all(
        &mut self,
        kinds: &[ResourceKind],
        driver: Arc<dyn ResourceDriver>,
    ) -> &mut Self {
        for kind in kinds {
            self.drivers.insert(*kind, driver.clone());
        }
        self
    }

    pub fn get(&self, kind: ResourceKind) -> Option<&Arc<dyn ResourceDriver>> {
        self.drivers.get(&kind)
    }

    /// Every kind served by one dry-run driver.
    pub fn dry_run(driver: Arc<DryRunDriver>) -> Self {
        let mut set = Self::new();
        set.register_all(&ResourceKind::ALL, driver);
        set
    }
}

/// Run an external program, feeding `stdin` and returning its stdout.
pub(crate) async fn run_process(
    program: &str,
    args: &[String],
    stdin: Option<Vec<u8>>,
    timeout: Duration,
) -> DriverResult<String> {
    debug!(program, ?args, "Running external command");

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        // The child may fill stdout before it drains stdin.
        tokio::spawn(async move {
            if let Err(e) = pipe.write_all(&input).await {
                debug!(error = %e, "Failed to write child stdin");
            }
        });
    }

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| DriverError::Timeout {
            program: program.to_string(),
            timeout,
        })??;

    if !output.status.success() {
        return Err(DriverError::CommandFailed {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Parse a JSON object printed by an external program into attributes.
pub(crate) fn parse_attributes(stdout: &str) -> DriverResult<Attributes> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Attributes::new());
    }
    serde_json::from_str(trimmed)
        .map_err(|e| DriverError::InvalidOutput(format!("expected a JSON object: {}", e)))
}
