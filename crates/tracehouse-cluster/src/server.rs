//! Frame server
//!
//! Accepts framed TCP connections and hands each decoded frame to a
//! [`FrameHandler`]. Every request frame is answered with an `Ack`, also
//! when the handler fails: senders never retry, so a failed frame is logged
//! and dropped here.
//!
//! The same server carries both inbound surfaces of a member:
//! [`DispatchHandler`] resumes graphs for remote dispatch, and the ingest
//! listener plugs in its own handler for agent records.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracehouse_observability::metrics;
use tracehouse_stream::GraphRegistry;
use tracing::{debug, error, info, warn};

use crate::codec::{Frame, FrameCodec};
use crate::error::{ClusterError, Result};

#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    async fn handle(&self, frame: Frame, peer: SocketAddr) -> Result<()>;
}

/// Resumes a graph after the sender's node
pub struct DispatchHandler {
    graphs: Arc<GraphRegistry>,
}

impl DispatchHandler {
    pub fn new(graphs: Arc<GraphRegistry>) -> Self {
        Self { graphs }
    }
}

#[async_trait]
impl FrameHandler for DispatchHandler {
    async fn handle(&self, frame: Frame, peer: SocketAddr) -> Result<()> {
        match frame {
            Frame::Dispatch {
                graph_id,
                node_id,
                record,
            } => {
                metrics::REMOTE_RECEIVED_TOTAL.inc();
                debug!(%peer, graph_id, node_id, record_id = %record.id, "Remote dispatch");
                let next = self
                    .graphs
                    .find_next(graph_id, node_id)
                    .map_err(tracehouse_stream::StreamError::from)?;
                next.execute(record).await?;
                Ok(())
            }
            other => Err(ClusterError::Protocol(format!(
                "Unexpected frame on dispatch port: {other:?}"
            ))),
        }
    }
}

pub struct RemoteServer {
    listener: TcpListener,
    handler: Arc<dyn FrameHandler>,
}

impl RemoteServer {
    pub async fn bind(addr: &str, handler: Arc<dyn FrameHandler>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, handler })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires.
    pub async fn run_until(self, shutdown: oneshot::Receiver<()>) {
        match self.listener.local_addr() {
            Ok(addr) => info!("Frame server listening on {}", addr),
            Err(e) => warn!("Frame server address unavailable: {}", e),
        }

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let handler = Arc::clone(&self.handler);
                            tokio::spawn(async move {
                                match handle_connection(stream, addr, handler).await {
                                    Err(ClusterError::ConnectionClosed) => {
                                        debug!("Connection closed: {}", addr);
                                    }
                                    Err(e) => {
                                        warn!("Connection error from {}: {}", addr, e);
                                    }
                                    Ok(()) => {}
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Frame server shutting down");
                    break;
                }
            }
        }
    }

    pub fn start(self, shutdown_rx: oneshot::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run_until(shutdown_rx))
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handler: Arc<dyn FrameHandler>,
) -> Result<()> {
    debug!("New connection from {}", addr);
    stream.set_nodelay(true)?;

    let mut framed = Framed::new(stream, FrameCodec::new());
    while let Some(result) = framed.next().await {
        let frame = match result {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Frame decode error from {}: {}", addr, e);
                return Err(e);
            }
        };

        if frame == Frame::Ack {
            continue;
        }
        if let Err(e) = handler.handle(frame, addr).await {
            warn!(peer = %addr, error = %e, "Dropping frame");
        }
        framed.send(Frame::Ack).await?;
    }

    Err(ClusterError::ConnectionClosed)
}
