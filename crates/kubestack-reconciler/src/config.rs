//! Reconciler wiring: which drivers serve which kinds, and where state lives.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use kubestack_core::{ResourceKind, Result};

use crate::driver::{CommandDriver, DriverSet, DryRunDriver, HelmDriver, KubeDriver};
use crate::reconciler::DriverReconciler;
use crate::state::{FileStateStore, MemoryStateStore, StateStore};

/// Kinds delegated to the external provisioner.
pub const PROVISIONED_KINDS: [ResourceKind; 3] = [
    ResourceKind::Cluster,
    ResourceKind::PolicyAttachment,
    ResourceKind::DnsRecord,
];

/// Configuration for the reference reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Directory holding one state document per stack
    pub state_dir: PathBuf,
    /// Path to helm binary
    pub helm_bin: String,
    /// Executable provisioning cloud resources
    pub provisioner: Option<String>,
    /// Per-call limit for external programs and ingress address waits
    pub timeout: Duration,
    /// Record driver calls instead of making them
    pub dry_run: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            state_dir: std::env::var("KUBESTACK_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".kubestack/state")),
            helm_bin: std::env::var("HELM_BIN").unwrap_or_else(|_| "helm".to_string()),
            provisioner: std::env::var("KUBESTACK_PROVISIONER").ok(),
            timeout: Duration::from_secs(600),
            dry_run: false,
        }
    }
}

impl ReconcilerConfig {
    /// Drivers that talk to the real systems.
    pub fn live_drivers(&self) -> DriverSet {
        let mut drivers = DriverSet::new();
        drivers.register_all(
            &[
                ResourceKind::Namespace,
                ResourceKind::ServiceAccount,
                ResourceKind::RawManifest,
            ],
            Arc::new(KubeDriver::new(self.timeout)),
        );
        drivers.register(
            ResourceKind::HelmRelease,
            Arc::new(HelmDriver::new(self.helm_bin.clone(), self.timeout)),
        );
        match &self.provisioner {
            Some(program) => {
                drivers.register_all(
                    &PROVISIONED_KINDS,
                    Arc::new(CommandDriver::new(program.clone(), self.timeout)),
                );
            }
            None => warn!("No provisioner configured; cluster, policy and DNS nodes will fail"),
        }
        drivers
    }

    /// Build the reconciler.
    ///
    /// A dry run starts from a copy of the recorded state and never writes it
    /// back, so its plans match a live run.
    pub async fn build(&self) -> Result<DriverReconciler> {
        let file_store = FileStateStore::new(&self.state_dir);
        if !self.dry_run {
            info!(state_dir = %self.state_dir.display(), "Using file state store");
            return Ok(DriverReconciler::new(Arc::new(file_store), self.live_drivers()));
        }

        let memory = MemoryStateStore::new();
        for stack in file_store.list().await? {
            if let Some(state) = file_store.load(&stack).await? {
                memory.save(&state).await?;
            }
        }
        info!(state_dir = %self.state_dir.display(), "Dry run, state changes stay in memory");
        Ok(DriverReconciler::new(
            Arc::new(memory),
            DriverSet::dry_run(Arc::new(DryRunDriver::new())),
        ))
    }
}
