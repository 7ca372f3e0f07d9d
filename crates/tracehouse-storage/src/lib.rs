//! Tracehouse Storage
//!
//! Durability and persistence edges of the collector:
//!
//! - [`BufferLog`]: append-only data files plus `writer.offset`, the point at
//!   which an ingested record is considered accepted
//! - [`BufferReader`]: tails the log behind the writer's committed position and
//!   replays records into a [`RecordSink`]
//! - [`Dao`]: the narrow contract the persistence cycle writes through, with
//!   [`InMemoryDao`] as the bundled backend
//!
//! ## Example
//!
//! ```ignore
//! let log = BufferLog::open(BufferConfig::new("./data/buffer")).await?;
//! log.write_buffer(&record).await?;
//!
//! let reader = BufferReader::open(log.config(), log.subscribe()).await?;
//! let handle = reader.start(sink, shutdown_rx);
//! ```

pub mod buffer;
pub mod config;
pub mod dao;
pub mod error;
pub mod offset;
pub mod reader;

pub use buffer::BufferLog;
pub use config::{parse_size, BufferConfig, SyncPolicy};
pub use dao::{Dao, InMemoryDao, MemoryWriteOp, WriteOp};
pub use error::{Error, Result};
pub use offset::BufferPosition;
pub use reader::{BufferReader, RecordSink, SinkError};
