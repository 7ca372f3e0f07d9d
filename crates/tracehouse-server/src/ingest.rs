//! Inbound frames
//!
//! One listener serves agents and peers. Ingest frames are checked against
//! their schema and appended to the buffer log; the buffer reader feeds them
//! to the graphs later. Dispatch frames from peers skip the buffer and
//! resume their graph directly.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracehouse_cluster::{ClusterError, DispatchHandler, Frame, FrameHandler};
use tracehouse_core::SchemaRegistry;
use tracehouse_observability::metrics;
use tracehouse_storage::BufferLog;
use tracehouse_stream::StreamError;
use tracing::debug;

const LISTENER_LABEL: &str = "frame";

pub struct InboundHandler {
    log: Arc<BufferLog>,
    schemas: Arc<SchemaRegistry>,
    dispatch: DispatchHandler,
}

impl InboundHandler {
    pub fn new(log: Arc<BufferLog>, schemas: Arc<SchemaRegistry>, dispatch: DispatchHandler) -> Self {
        Self {
            log,
            schemas,
            dispatch,
        }
    }
}

#[async_trait]
impl FrameHandler for InboundHandler {
    async fn handle(&self, frame: Frame, peer: SocketAddr) -> Result<(), ClusterError> {
        match frame {
            Frame::Ingest(record) => {
                self.schemas.get(record.schema_id)?.validate(&record)?;
                self.log
                    .write_buffer(&record)
                    .await
                    .map_err(StreamError::from)?;
                metrics::INGEST_RECORDS_TOTAL
                    .with_label_values(&[LISTENER_LABEL])
                    .inc();
                debug!(%peer, schema_id = record.schema_id, record_id = %record.id, "Record buffered");
                Ok(())
            }
            dispatch @ Frame::Dispatch { .. } => self.dispatch.handle(dispatch, peer).await,
            Frame::Ack => Err(ClusterError::Protocol("Unexpected ack".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{self, SERVICE_METRIC_SCHEMA};
    use tempfile::TempDir;
    use tracehouse_core::{Record, Value};
    use tracehouse_storage::{BufferConfig, BufferReader};
    use tracehouse_stream::GraphRegistry;

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 5555))
    }

    #[tokio::test]
    async fn test_ingest_appends_valid_records() {
        let dir = TempDir::new().unwrap();
        let config = BufferConfig::new(dir.path());
        let log = Arc::new(BufferLog::open(config.clone()).await.unwrap());
        let schemas = Arc::new(pipeline::schemas().unwrap());
        let handler = InboundHandler::new(
            Arc::clone(&log),
            schemas,
            DispatchHandler::new(Arc::new(GraphRegistry::new())),
        );

        let good = Record::new(
            SERVICE_METRIC_SCHEMA,
            "checkout",
            202410181200,
            vec![Value::Long(1), Value::Long(0), Value::Long(12), Value::Int(200)],
        );
        handler.handle(Frame::Ingest(good.clone()), peer()).await.unwrap();

        // Wrong arity
        let bad = Record::new(SERVICE_METRIC_SCHEMA, "checkout", 0, vec![Value::Long(1)]);
        assert!(matches!(
            handler.handle(Frame::Ingest(bad), peer()).await,
            Err(ClusterError::Record(_))
        ));
        // Unknown schema
        let unknown = Record::new(42, "x", 0, vec![]);
        assert!(handler.handle(Frame::Ingest(unknown), peer()).await.is_err());

        let mut reader = BufferReader::open(&config, log.subscribe()).await.unwrap();
        assert_eq!(reader.read_batch(10).await.unwrap(), vec![good]);
    }

    #[tokio::test]
    async fn test_dispatch_to_unknown_graph_fails() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(BufferLog::open(BufferConfig::new(dir.path())).await.unwrap());
        let handler = InboundHandler::new(
            log,
            Arc::new(pipeline::schemas().unwrap()),
            DispatchHandler::new(Arc::new(GraphRegistry::new())),
        );

        let frame = Frame::Dispatch {
            graph_id: 1,
            node_id: 1,
            record: Record::new(1, "a", 0, vec![]),
        };
        assert!(matches!(
            handler.handle(frame, peer()).await,
            Err(ClusterError::Stream(_))
        ));
        assert!(handler.handle(Frame::Ack, peer()).await.is_err());
    }
}
