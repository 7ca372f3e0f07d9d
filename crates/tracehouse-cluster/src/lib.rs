//! Tracehouse Cluster
//!
//! Spreads graph work across collector members.
//!
//! ## Components
//!
//! - **ClusterMembership**: copy-on-write role → endpoint table
//! - **Router**: round-robin or consistent-hash pick of a member per record
//! - **FrameCodec**: length-prefixed ingest / dispatch / ack frames
//! - **RemoteWorker**: graph stage that forwards records to their owner
//! - **RemoteServer**: accept loop that resumes graphs for remote records
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tracehouse_cluster::{
//!     ClusterMembership, RemoteAddress, RemoteWorker, Router, RoutingStrategy, TcpRemoteSender,
//! };
//!
//! let membership = Arc::new(ClusterMembership::new(RemoteAddress::new("10.0.1.5", 11800), 100));
//! membership.join("persistence", RemoteAddress::new("10.0.1.5", 11800));
//! membership.join("persistence", RemoteAddress::new("10.0.1.6", 11800));
//!
//! let router = Arc::new(Router::new(membership, RoutingStrategy::ConsistentHash));
//! let sender = Arc::new(TcpRemoteSender::new(Duration::from_secs(3)));
//! let remote = RemoteWorker::new(3, 1, "persistence", router, sender);
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod membership;
pub mod remote;
pub mod ring;
pub mod router;
pub mod server;

pub use codec::{Frame, FrameCodec};
pub use config::ClusterConfig;
pub use error::{ClusterError, Result};
pub use membership::{ClusterMembership, MembershipTable, RemoteAddress, RoleMembers};
pub use remote::{RemoteSender, RemoteWorker, TcpRemoteSender};
pub use ring::HashRing;
pub use router::{Endpoint, Router, RoutingStrategy};
pub use server::{DispatchHandler, FrameHandler, RemoteServer};
