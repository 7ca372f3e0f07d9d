//! Tracehouse Core
//!
//! Data model shared by every stage of the collector:
//!
//! - [`Record`]: a typed, fixed-arity tuple tagged with a schema id, an identity
//!   key and a coarse time bucket
//! - [`Schema`]: field layout plus the per-field merge operation used when two
//!   records with the same aggregation key meet
//! - [`varint`]: ZigZag/LEB128 integer codec used by the record wire format

pub mod error;
pub mod record;
pub mod schema;
pub mod varint;

pub use error::{Error, Result};
pub use record::{AggregationKey, Record, Value};
pub use schema::{FieldDef, FieldKind, MergeOp, Schema, SchemaId, SchemaRegistry};
