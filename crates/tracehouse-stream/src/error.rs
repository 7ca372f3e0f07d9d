//! Error types for the stream engine
//!
//! [`GraphError`] covers graph construction and coordinate lookup; everything
//! else a stage, worker or the persistence cycle can hit is a [`StreamError`].

use thiserror::Error;
use tracehouse_core::SchemaId;

use crate::graph::{GraphId, NodeId};

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Duplicate node {node_id} in graph {graph_id}")]
    DuplicateNode { graph_id: GraphId, node_id: NodeId },

    #[error("Node {node_id} not found in graph {graph_id}")]
    NodeNotFound { graph_id: GraphId, node_id: NodeId },

    #[error("Graph not found: {0}")]
    GraphNotFound(GraphId),

    #[error("Duplicate graph: {0}")]
    DuplicateGraph(GraphId),

    #[error("Graph {0} already has an entry node")]
    EntryAlreadySet(GraphId),

    #[error("Graph {0} has no entry node")]
    MissingEntry(GraphId),
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Record error: {0}")]
    Record(#[from] tracehouse_core::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] tracehouse_storage::Error),

    #[error("No graph accepts schema {0}")]
    NoRoute(SchemaId),

    #[error("Worker {0} is closed")]
    WorkerClosed(String),

    #[error("Worker {0} did not answer in time")]
    WorkerTimeout(String),

    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}
