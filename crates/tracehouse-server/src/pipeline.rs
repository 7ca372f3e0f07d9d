//! Demo pipelines
//!
//! Two graphs modelled on a tracing backend's metric streams:
//!
//! ```text
//! SERVICE_METRIC_GRAPH (100)
//!   [1 aggregate] ──► [2 remote: persistence role] ──► [3 persist]
//!
//! JVM_METRIC_GRAPH (200)
//!   [1 persist]
//! ```
//!
//! Service metrics are pre-aggregated on whichever member received them,
//! then routed to the member owning the service for the final window.
//! JVM metrics are already per instance and go straight to persistence.
//!
//! Every member builds the same graphs so remote dispatch can resume at
//! `(SERVICE_METRIC_GRAPH, REMOTE_NODE)` on the receiving side.

use std::sync::Arc;

use tracehouse_cluster::{RemoteSender, RemoteWorker, Router};
use tracehouse_core::{FieldDef, FieldKind, MergeOp, Schema, SchemaId, SchemaRegistry};
use tracehouse_stream::{
    AggregationWorker, Dispatcher, GraphId, GraphRegistry, LocalWorkerRef, NodeId,
    PersistenceWorker, WorkerConfig, WorkerHandle, WorkerRuntime,
};

use crate::error::Result;

pub const SERVICE_METRIC_SCHEMA: SchemaId = 1;
pub const JVM_METRIC_SCHEMA: SchemaId = 2;

pub const SERVICE_METRIC_GRAPH: GraphId = 100;
pub const JVM_METRIC_GRAPH: GraphId = 200;

pub const AGGREGATE_NODE: NodeId = 1;
pub const REMOTE_NODE: NodeId = 2;
pub const PERSIST_NODE: NodeId = 3;

/// Role of members that own persistence windows
pub const PERSISTENCE_ROLE: &str = "persistence";

pub fn schemas() -> Result<SchemaRegistry> {
    let mut registry = SchemaRegistry::new();
    registry.register(Schema::new(
        SERVICE_METRIC_SCHEMA,
        "service_metric",
        vec![
            FieldDef::new("calls", FieldKind::Long, MergeOp::Sum),
            FieldDef::new("errors", FieldKind::Long, MergeOp::Sum),
            FieldDef::new("duration_sum", FieldKind::Long, MergeOp::Sum),
            FieldDef::new("last_status", FieldKind::Int, MergeOp::Cover),
        ],
    )?)?;
    registry.register(Schema::new(
        JVM_METRIC_SCHEMA,
        "jvm_metric",
        vec![
            FieldDef::new("heap_used", FieldKind::Long, MergeOp::Cover),
            FieldDef::new("gc_count", FieldKind::Long, MergeOp::Sum),
            FieldDef::new("thread_count", FieldKind::Int, MergeOp::Cover),
            FieldDef::new("instance", FieldKind::String, MergeOp::NonOp),
        ],
    )?)?;
    Ok(registry)
}

/// Everything the composition root needs to run the graphs
pub struct Pipeline {
    pub schemas: Arc<SchemaRegistry>,
    pub graphs: Arc<GraphRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub runtime: WorkerRuntime,
    /// Persistence workers polled by the persistence cycle
    pub persistence_workers: Vec<WorkerHandle>,
}

pub fn build(
    config: &WorkerConfig,
    router: Arc<Router>,
    sender: Arc<dyn RemoteSender>,
) -> Result<Pipeline> {
    let schemas = Arc::new(schemas()?);
    let mut graphs = GraphRegistry::new();
    let mut runtime = WorkerRuntime::new();
    let mut persistence_workers = Vec::new();

    // Service metrics
    let (aggregate, aggregate_runner) = LocalWorkerRef::new(
        AGGREGATE_NODE,
        "service-metric-aggregate",
        AggregationWorker::new(Arc::clone(&schemas), config.force_flush_count),
        &config.channel,
    )?;
    let remote = Arc::new(RemoteWorker::new(
        REMOTE_NODE,
        SERVICE_METRIC_GRAPH,
        PERSISTENCE_ROLE,
        router,
        sender,
    ));
    let (persist, persist_runner) = LocalWorkerRef::new(
        PERSIST_NODE,
        "service-metric-persist",
        PersistenceWorker::new(Arc::clone(&schemas), config.force_flush_count),
        &config.channel,
    )?;
    persistence_workers.push(persist.handle());

    let mut builder = graphs.create_graph(SERVICE_METRIC_GRAPH)?;
    builder
        .add_entry_node(aggregate)?
        .add_next(remote)?
        .add_next(persist)?;
    graphs.register(builder.build()?)?;
    runtime.register(SERVICE_METRIC_GRAPH, aggregate_runner);
    runtime.register(SERVICE_METRIC_GRAPH, persist_runner);

    // JVM metrics
    let (jvm_persist, jvm_runner) = LocalWorkerRef::new(
        1,
        "jvm-metric-persist",
        PersistenceWorker::new(Arc::clone(&schemas), config.force_flush_count),
        &config.channel,
    )?;
    persistence_workers.push(jvm_persist.handle());

    let mut builder = graphs.create_graph(JVM_METRIC_GRAPH)?;
    builder.add_entry_node(jvm_persist)?;
    graphs.register(builder.build()?)?;
    runtime.register(JVM_METRIC_GRAPH, jvm_runner);

    let graphs = Arc::new(graphs);
    let dispatcher = Dispatcher::new(Arc::clone(&graphs), Arc::clone(&schemas))
        .route(SERVICE_METRIC_SCHEMA, SERVICE_METRIC_GRAPH)?
        .route(JVM_METRIC_SCHEMA, JVM_METRIC_GRAPH)?;

    Ok(Pipeline {
        schemas,
        graphs,
        dispatcher: Arc::new(dispatcher),
        runtime,
        persistence_workers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tracehouse_cluster::{ClusterMembership, RemoteAddress, RoutingStrategy, TcpRemoteSender};

    fn pipeline() -> Pipeline {
        let membership = Arc::new(ClusterMembership::new(RemoteAddress::new("127.0.0.1", 1), 16));
        membership.join(PERSISTENCE_ROLE, RemoteAddress::new("127.0.0.1", 1));
        let router = Arc::new(Router::new(membership, RoutingStrategy::ConsistentHash));
        let sender = Arc::new(TcpRemoteSender::new(Duration::from_millis(100)));
        build(&WorkerConfig::default(), router, sender).unwrap()
    }

    #[test]
    fn test_graph_shape() {
        let pipeline = pipeline();
        assert_eq!(
            pipeline.graphs.graph_ids(),
            vec![SERVICE_METRIC_GRAPH, JVM_METRIC_GRAPH]
        );

        let service = pipeline.graphs.find(SERVICE_METRIC_GRAPH).unwrap();
        assert_eq!(service.entry_id(), AGGREGATE_NODE);
        assert_eq!(service.find_next(AGGREGATE_NODE).unwrap().ids(), vec![REMOTE_NODE]);
        assert_eq!(service.find_next(REMOTE_NODE).unwrap().ids(), vec![PERSIST_NODE]);
        assert!(service.find_next(PERSIST_NODE).unwrap().is_empty());

        assert_eq!(pipeline.graphs.find(JVM_METRIC_GRAPH).unwrap().node_count(), 1);
        assert_eq!(pipeline.persistence_workers.len(), 2);
    }

    #[test]
    fn test_routes() {
        let pipeline = pipeline();
        assert_eq!(
            pipeline.dispatcher.graph_for(SERVICE_METRIC_SCHEMA),
            Some(SERVICE_METRIC_GRAPH)
        );
        assert_eq!(pipeline.dispatcher.graph_for(JVM_METRIC_SCHEMA), Some(JVM_METRIC_GRAPH));
        assert_eq!(pipeline.dispatcher.graph_for(99), None);
        assert_eq!(pipeline.schemas.len(), 2);
    }
}
