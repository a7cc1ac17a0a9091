//! Driver errors.

use std::time::Duration;
use thiserror::Error;

use kubestack_core::ResourceKind;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{program} exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{program} did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("unexpected output: {0}")]
    InvalidOutput(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("driver {driver} does not handle {kind}")]
    Unsupported { driver: &'static str, kind: ResourceKind },

    #[error("injected failure: {0}")]
    Injected(String),
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;
