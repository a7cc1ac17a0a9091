//! KDL configuration parsing for kubestack.
//!
//! This crate handles parsing of:
//! - Stack files (kubestack.kdl) into validated stack sets
//! - Variable interpolation
//! - JSON documents referenced by stack files (policies, manifests, values)

pub mod documents;
pub mod error;
pub mod stackfile;
pub mod variables;

pub use documents::DocumentLoader;
pub use error::{ConfigError, ConfigResult};
pub use stackfile::{STACK_FILE_NAME, StackFile, load_stack_file, parse_stack_file};
pub use variables::{VariableContext, VariableContextBuilder};
