//! Tracehouse Collector Server
//!
//! Wires the collector together:
//!
//! - [`config`]: `TRACEHOUSE_*` environment configuration
//! - [`pipeline`]: demo schemas and graphs with their well-known ids
//! - [`ingest`]: handler for frames arriving from agents and peers
//! - [`app`]: the [`Collector`] composition root with ordered start and stop

pub mod app;
pub mod config;
pub mod error;
pub mod ingest;
pub mod pipeline;

pub use app::Collector;
pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use ingest::InboundHandler;
