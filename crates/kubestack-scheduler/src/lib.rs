//! Deployment-unit orchestration for kubestack.
//!
//! Runs the stacks of a deploy or destroy in dependency order against a
//! reconciler, reporting progress as events.

pub mod orchestrator;

pub use orchestrator::{RunResult, StackEvent, StackOrchestrator};
