//! Error types for the collector server

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid value for {key}: {reason}")]
    InvalidEnv { key: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] tracehouse_storage::Error),

    #[error("Stream error: {0}")]
    Stream(#[from] tracehouse_stream::StreamError),

    #[error("Graph error: {0}")]
    Graph(#[from] tracehouse_stream::GraphError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] tracehouse_cluster::ClusterError),

    #[error("Schema error: {0}")]
    Schema(#[from] tracehouse_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
