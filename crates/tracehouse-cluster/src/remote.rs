//! Remote dispatch
//!
//! A [`RemoteWorker`] is a graph stage that splits a graph across the
//! cluster. It asks the [`Router`] who owns the record:
//!
//! ```text
//!   local member                          remote member
//!   ────────────                          ─────────────
//!   [agg] ──► [remote 3] ── Dispatch{g, 3, record} ──► RemoteServer
//!                 │                                        │
//!                 │ Endpoint::Local                        ▼
//!                 ▼                                find_next(g, 3)
//!            next.execute                          .execute(record)
//! ```
//!
//! Every member registers the same graphs, so the receiver resumes after the
//! sender's own node id. Sends wait for an `Ack` up to a timeout; a failed
//! send is logged, counted and dropped.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracehouse_core::Record;
use tracehouse_observability::metrics;
use tracehouse_stream::{GraphId, Next, NodeId, NodeProcessor};
use tracing::{debug, warn};

use crate::codec::{Frame, FrameCodec};
use crate::error::{ClusterError, Result};
use crate::membership::RemoteAddress;
use crate::router::{Endpoint, Router};

/// Transport for records leaving this member
#[async_trait]
pub trait RemoteSender: Send + Sync {
    /// Deliver `record` to `target`, to resume `graph_id` after `node_id`.
    async fn send(
        &self,
        target: &RemoteAddress,
        graph_id: GraphId,
        node_id: NodeId,
        record: Record,
    ) -> Result<()>;
}

type Connection = Framed<TcpStream, FrameCodec>;
type ConnectionSlot = Arc<Mutex<Option<Connection>>>;

/// Framed TCP client keeping one connection per peer
///
/// A connection that fails in any way is dropped and reopened by the next
/// send to that peer.
pub struct TcpRemoteSender {
    timeout: Duration,
    connections: std::sync::Mutex<HashMap<RemoteAddress, ConnectionSlot>>,
}

impl TcpRemoteSender {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            connections: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, target: &RemoteAddress) -> ConnectionSlot {
        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(connections.entry(target.clone()).or_default())
    }

    async fn exchange(&self, target: &RemoteAddress, conn: &mut Option<Connection>, frame: Frame) -> Result<()> {
        if conn.is_none() {
            let stream = timeout(self.timeout, TcpStream::connect(target.to_string()))
                .await
                .map_err(|_| ClusterError::Timeout(target.clone()))??;
            stream.set_nodelay(true)?;
            debug!(peer = %target, "Connected to peer");
            *conn = Some(Framed::new(stream, FrameCodec::new()));
        }
        let framed = conn.as_mut().ok_or(ClusterError::ConnectionClosed)?;

        timeout(self.timeout, framed.send(frame))
            .await
            .map_err(|_| ClusterError::Timeout(target.clone()))??;

        match timeout(self.timeout, framed.next()).await {
            Err(_) => Err(ClusterError::Timeout(target.clone())),
            Ok(None) => Err(ClusterError::ConnectionClosed),
            Ok(Some(Ok(Frame::Ack))) => Ok(()),
            Ok(Some(Ok(other))) => Err(ClusterError::Protocol(format!(
                "Expected ack from {target}, got {other:?}"
            ))),
            Ok(Some(Err(e))) => Err(e),
        }
    }
}

#[async_trait]
impl RemoteSender for TcpRemoteSender {
    async fn send(
        &self,
        target: &RemoteAddress,
        graph_id: GraphId,
        node_id: NodeId,
        record: Record,
    ) -> Result<()> {
        let peer = target.to_string();
        let slot = self.slot(target);
        let mut conn = slot.lock().await;

        let frame = Frame::Dispatch {
            graph_id,
            node_id,
            record,
        };
        match self.exchange(target, &mut conn, frame).await {
            Ok(()) => {
                metrics::REMOTE_SENDS_TOTAL.with_label_values(&[peer.as_str()]).inc();
                Ok(())
            }
            Err(e) => {
                *conn = None;
                metrics::REMOTE_SEND_FAILURES_TOTAL
                    .with_label_values(&[peer.as_str()])
                    .inc();
                Err(e)
            }
        }
    }
}

/// Graph stage that hands records to the member owning them
pub struct RemoteWorker {
    id: NodeId,
    graph_id: GraphId,
    role: String,
    router: Arc<Router>,
    sender: Arc<dyn RemoteSender>,
}

impl RemoteWorker {
    pub fn new(
        id: NodeId,
        graph_id: GraphId,
        role: impl Into<String>,
        router: Arc<Router>,
        sender: Arc<dyn RemoteSender>,
    ) -> Self {
        Self {
            id,
            graph_id,
            role: role.into(),
            router,
            sender,
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }
}

#[async_trait]
impl NodeProcessor for RemoteWorker {
    fn id(&self) -> NodeId {
        self.id
    }

    async fn process(&self, input: Record, next: &Next) -> tracehouse_stream::Result<()> {
        match self.router.select_worker(&self.role, &input)? {
            Endpoint::Local => next.execute(input).await,
            Endpoint::Remote(target) => {
                let id = input.id.clone();
                if let Err(e) = self.sender.send(&target, self.graph_id, self.id, input).await {
                    warn!(
                        peer = %target,
                        graph_id = self.graph_id,
                        node_id = self.id,
                        record_id = %id,
                        error = %e,
                        "Remote send failed, dropping record"
                    );
                }
                Ok(())
            }
        }
    }
}
