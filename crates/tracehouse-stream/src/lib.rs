//! Tracehouse Stream
//!
//! The analysis core of the collector:
//!
//! - [`graph`]: graphs of [`NodeProcessor`] stages with `start` / `find_next`
//! - [`channel`]: partitioned ring buffers with blocking, drop and overwrite admission
//! - [`worker`]: local workers that run one stage on their own task
//! - [`aggregation`]: keyed merge caches and the aggregation / persistence stages
//! - [`persistence`]: the periodic flush-and-write cycle over the DAO
//! - [`dispatcher`]: schema id → graph routing for ingested records

pub mod aggregation;
pub mod channel;
pub mod dispatcher;
pub mod error;
pub mod graph;
pub mod persistence;
pub mod worker;

pub use aggregation::{AggregationCache, AggregationWorker, PersistenceWorker, WindowCache};
pub use channel::{Admission, BufferStrategy, ChannelConfig, Channels, PartitionSelector};
pub use dispatcher::Dispatcher;
pub use error::{GraphError, Result, StreamError};
pub use graph::{Graph, GraphBuilder, GraphId, GraphRegistry, Next, NodeBuilder, NodeId, NodeProcessor};
pub use persistence::{CycleState, PersistenceConfig, PersistenceCycle, TickReport};
pub use worker::{LocalWorkerRef, WorkHandler, WorkerCommand, WorkerConfig, WorkerHandle, WorkerRunner, WorkerRuntime};
