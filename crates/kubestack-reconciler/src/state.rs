//! Observed state of applied stacks.
//!
//! State records, per stack, what was last applied for every node: the
//! fingerprint of its declared config, the resolved config sent to the driver
//! and the attributes the driver reported back. It is written after every
//! successful node so an interrupted apply resumes where it stopped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

use kubestack_core::{Attributes, Environment, Error, ResourceConfig, ResourceKind, Result};

/// What was last applied for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub kind: ResourceKind,
    pub fingerprint: String,
    /// Config as sent to the driver, bindings filled in.
    pub config: ResourceConfig,
    pub attributes: Attributes,
    /// Position in the stack's apply history; deletes run in reverse.
    pub order: u64,
    pub applied_at: DateTime<Utc>,
}

/// State of one stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackState {
    pub stack: String,
    pub environment: Environment,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,
    #[serde(default)]
    pub next_order: u64,
    pub updated_at: DateTime<Utc>,
}

impl StackState {
    pub fn new(stack: impl Into<String>, environment: Environment) -> Self {
        Self {
            stack: stack.into(),
            environment,
            tags: BTreeMap::new(),
            resources: BTreeMap::new(),
            next_order: 0,
            updated_at: Utc::now(),
        }
    }

    /// Record a successful apply. A node applied before keeps its position.
    pub fn record(
        &mut self,
        node: &str,
        kind: ResourceKind,
        fingerprint: String,
        config: ResourceConfig,
        attributes: Attributes,
    ) {
        let order = match self.resources.get(node) {
            Some(existing) if existing.kind == kind => existing.order,
            _ => {
                let order = self.next_order;
                self.next_order += 1;
                order
            }
        };
        let now = Utc::now();
        self.resources.insert(
            node.to_string(),
            ResourceState {
                kind,
                fingerprint,
                config,
                attributes,
                order,
                applied_at: now,
            },
        );
        self.updated_at = now;
    }

    pub fn forget(&mut self, node: &str) -> Option<ResourceState> {
        let removed = self.resources.remove(node);
        self.updated_at = Utc::now();
        removed
    }

    /// Recorded nodes, most recently created first.
    pub fn reverse_apply_order(&self) -> Vec<(&str, &ResourceState)> {
        let mut nodes: Vec<(&str, &ResourceState)> = self
            .resources
            .iter()
            .map(|(name, state)| (name.as_str(), state))
            .collect();
        nodes.sort_by(|a, b| b.1.order.cmp(&a.1.order));
        nodes
    }

    /// Attributes of every recorded node, keyed by node name.
    pub fn attributes(&self) -> BTreeMap<String, Attributes> {
        self.resources
            .iter()
            .map(|(name, state)| (name.clone(), state.attributes.clone()))
            .collect()
    }
}

/// Persistence for stack state.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, stack: &str) -> Result<Option<StackState>>;

    async fn save(&self, state: &StackState) -> Result<()>;

    async fn remove(&self, stack: &str) -> Result<()>;

    /// Names of the stacks with recorded state.
    async fn list(&self) -> Result<Vec<String>>;
}

/// In-memory state, used by dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    stacks: RwLock<HashMap<String, StackState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, stack: &str) -> Result<Option<StackState>> {
        Ok(self.stacks.read().await.get(stack).cloned())
    }

    async fn save(&self, state: &StackState) -> Result<()> {
        self.stacks
            .write()
            .await
            .insert(state.stack.clone(), state.clone());
        Ok(())
    }

    async fn remove(&self, stack: &str) -> Result<()> {
        self.stacks.write().await.remove(stack);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.stacks.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// One JSON document per stack in a directory.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, stack: &str) -> PathBuf {
        self.dir.join(format!("{}.json", stack))
    }
}

fn state_error(action: &str, path: &Path, e: impl std::fmt::Display) -> Error {
    Error::State(format!("{} {}: {}", action, path.display(), e))
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, stack: &str) -> Result<Option<StackState>> {
        let path = self.path(stack);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(state_error("read", &path, e)),
        };
        let state = serde_json::from_slice(&bytes).map_err(|e| state_error("parse", &path, e))?;
        Ok(Some(state))
    }

    async fn save(&self, state: &StackState) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| state_error("create", &self.dir, e))?;
        let path = self.path(&state.stack);
        let tmp = path.with_extension("json.tmp");
        let bytes =
            serde_json::to_vec_pretty(state).map_err(|e| state_error("serialize", &path, e))?;
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| state_error("write", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| state_error("rename", &path, e))?;
        debug!(stack = %state.stack, path = %path.display(), "Saved state");
        Ok(())
    }

    async fn remove(&self, stack: &str) -> Result<()> {
        let path = self.path(stack);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(state_error("remove", &path, e)),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(state_error("list", &self.dir, e)),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| state_error("list", &self.dir, e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubestack_core::resource::NamespaceConfig;
    use serde_json::json;

    fn namespace(name: &str) -> ResourceConfig {
        ResourceConfig::Namespace(NamespaceConfig {
            name: name.to_string(),
            labels: Default::default(),
        })
    }

    fn sample() -> StackState {
        let env = Environment::new("532673134317", "eu-west-1").unwrap();
        let mut state = StackState::new("FastApiEksCluster", env);
        state.record(
            "Monitoring",
            ResourceKind::Namespace,
            "f1".to_string(),
            namespace("amazon-cloudwatch"),
            Attributes::from([("name".to_string(), json!("amazon-cloudwatch"))]),
        );
        state.record(
            "Apps",
            ResourceKind::Namespace,
            "f2".to_string(),
            namespace("apps"),
            Attributes::new(),
        );
        state
    }

    #[test]
    fn test_record_keeps_order_on_update() {
        let mut state = sample();
        state.record(
            "Monitoring",
            ResourceKind::Namespace,
            "f3".to_string(),
            namespace("amazon-cloudwatch"),
            Attributes::new(),
        );
        let order: Vec<&str> = state.reverse_apply_order().into_iter().map(|(n, _)| n).collect();
        assert_eq!(order, vec!["Apps", "Monitoring"]);
        assert_eq!(state.resources["Monitoring"].fingerprint, "f3");
        assert_eq!(state.next_order, 2);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStateStore::new();
        assert!(store.load("FastApiEksCluster").await.unwrap().is_none());
        store.save(&sample()).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["FastApiEksCluster"]);
        store.remove("FastApiEksCluster").await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let state = sample();

        FileStateStore::new(dir.path().join("state")).save(&state).await.unwrap();

        let store = FileStateStore::new(dir.path().join("state"));
        let loaded = store.load("FastApiEksCluster").await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(store.list().await.unwrap(), vec!["FastApiEksCluster"]);

        store.remove("FastApiEksCluster").await.unwrap();
        store.remove("FastApiEksCluster").await.unwrap();
        assert!(store.load("FastApiEksCluster").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_state() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();
        let store = FileStateStore::new(dir.path());
        assert!(matches!(store.load("broken").await, Err(Error::State(_))));
    }
}
