//! Reference reconciler for kubestack.
//!
//! Provides:
//! - `DriverReconciler`, diffing stacks against recorded state
//! - State stores (in memory, one JSON file per stack)
//! - Drivers: Kubernetes API, helm, external provisioner, dry run

pub mod config;
pub mod driver;
pub mod error;
pub mod reconciler;
pub mod state;

pub use config::ReconcilerConfig;
pub use driver::{DriverContext, DriverSet, DryRunDriver, ResourceDriver};
pub use error::{DriverError, DriverResult};
pub use reconciler::DriverReconciler;
pub use state::{FileStateStore, MemoryStateStore, StackState, StateStore};
