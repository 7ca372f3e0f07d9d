//! Error types for cluster routing and remote dispatch

use thiserror::Error;
use tracehouse_stream::StreamError;

use crate::membership::RemoteAddress;

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("No endpoint registered for role {0}")]
    NoEndpoint(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Timed out waiting for {0}")]
    Timeout(RemoteAddress),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Record error: {0}")]
    Record(#[from] tracehouse_core::Error),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ClusterError> for StreamError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::Stream(inner) => inner,
            other => StreamError::Routing(other.to_string()),
        }
    }
}
