//! Error Types for Tracehouse Core
//!
//! ## Error Categories
//!
//! - `Io`: reading or writing encoded records
//! - `Decode`: truncated or malformed record bytes (never a panic)
//! - `InvalidSchema`: a schema that cannot be constructed, e.g. SUM on a STRING field
//! - `SchemaMismatch`: a record whose arity or field kinds disagree with its schema
//! - `UnknownSchema`: a schema id that was never registered

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Unknown schema: {0}")]
    UnknownSchema(u32),
}

pub type Result<T> = std::result::Result<T, Error>;
