//! Identifiers.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a node within one resource graph.
///
/// Ids are handed out in declaration order, so comparing two ids of the same
/// graph compares the order in which their nodes were declared. An id also
/// names the graph that minted it; other graphs treat it as unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Display)]
#[display("#{index}")]
pub struct NodeId {
    graph: u32,
    index: usize,
}

impl NodeId {
    pub(crate) fn new(graph: u32, index: usize) -> Self {
        Self { graph, index }
    }

    pub(crate) fn graph(&self) -> u32 {
        self.graph
    }

    /// Position of the node in declaration order.
    pub fn index(&self) -> usize {
        self.index
    }
}

/// A unique identifier for one deploy or destroy run.
/// Uses UUIDv7 for time-ordered, sortable IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}
