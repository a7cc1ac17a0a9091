//! Core domain types and traits for kubestack.
//!
//! This crate contains:
//! - Node and run identifiers
//! - The error taxonomy shared by every crate
//! - Kind-specific resource configurations
//! - The resource graph builder and frozen graphs
//! - Stacks (deployment units), outputs and unit status
//! - The reconciler contract and plan types

mod dag;

pub mod error;
pub mod graph;
pub mod id;
pub mod reconciler;
pub mod resource;
pub mod stack;

pub use error::{Error, Result};
pub use graph::{Binding, BindingSource, GraphBuilder, ResourceGraph, ResourceNode};
pub use id::{NodeId, RunId};
pub use reconciler::{
    ApplyReport, Attributes, ChangeAction, Plan, PlanSummary, Reconciler, ResourceChange,
};
pub use resource::{ResourceConfig, ResourceKind};
pub use stack::{
    Environment, OutputRef, OutputStore, Stack, StackBuilder, StackOutputs, StackSet, StackStatus,
};
