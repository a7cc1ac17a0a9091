//! JSON documents referenced from stack files (policies, manifests, chart
//! values). Paths are relative to the directory holding the stack file.

use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::variables::VariableContext;
use crate::{ConfigError, ConfigResult};

/// Resolves and loads documents for one stack file.
#[derive(Debug, Clone)]
pub struct DocumentLoader {
    base_dir: PathBuf,
}

impl DocumentLoader {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn resolve(&self, relative: &str) -> PathBuf {
        let path = Path::new(relative);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Read a JSON document and interpolate the strings it contains.
    pub fn load_json(&self, relative: &str, vars: &VariableContext) -> ConfigResult<Value> {
        let path = self.resolve(relative);
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Document {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let value: Value = serde_json::from_str(&text).map_err(|e| ConfigError::Document {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        debug!(path = %path.display(), "Loaded document");
        Ok(vars.interpolate_json(value))
    }

    /// Like [`load_json`](Self::load_json) but the document must be a JSON
    /// object.
    pub fn load_object(&self, relative: &str, vars: &VariableContext) -> ConfigResult<Value> {
        let value = self.load_json(relative, vars)?;
        if !value.is_object() {
            return Err(ConfigError::Document {
                path: self.resolve(relative).display().to_string(),
                message: "expected a JSON object".to_string(),
            });
        }
        Ok(value)
    }
}
