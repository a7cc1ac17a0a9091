//! Error types for kubestack.

use thiserror::Error;

use crate::resource::ResourceKind;
use crate::stack::StackStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("duplicate name '{name}' in {scope}")]
    DuplicateName { scope: String, name: String },

    #[error("invalid config for '{node}': {message}")]
    InvalidConfig { node: String, message: String },

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("unknown stack: {0}")]
    UnknownStack(String),

    #[error("dependency cycle: '{dependent}' cannot depend on '{dependency}'")]
    Cycle {
        dependent: String,
        dependency: String,
    },

    #[error("graph for stack '{0}' is frozen")]
    FrozenGraph(String),

    #[error("dangling reference to {stack}.{output}: {reason}")]
    DanglingReference {
        stack: String,
        output: String,
        reason: String,
    },

    #[error("reconcile failed for {kind} '{node}': {message}")]
    Reconcile {
        node: String,
        kind: ResourceKind,
        message: String,
    },

    #[error("stack '{stack}' cannot move from {from} to {to}")]
    InvalidTransition {
        stack: String,
        from: StackStatus,
        to: StackStatus,
    },

    #[error("state error: {0}")]
    State(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn invalid(node: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidConfig {
            node: node.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
