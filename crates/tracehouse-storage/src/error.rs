//! Storage Error Types
//!
//! - `Io`: data or offset file operations
//! - `Codec`: a record that could not be encoded or decoded
//! - `CorruptOffset`: an offset file that is not valid JSON
//! - `InvalidConfig`: bad size strings or thresholds
//! - `Dao`: the storage backend rejected a read or a batch

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] tracehouse_core::Error),

    #[error("Corrupt offset file {path}: {reason}")]
    CorruptOffset { path: String, reason: String },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("DAO error: {0}")]
    Dao(String),
}
