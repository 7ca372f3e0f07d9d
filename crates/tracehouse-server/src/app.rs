//! Collector composition root
//!
//! Builds every component from a [`ServerConfig`], starts them in dependency
//! order and stops them in reverse:
//!
//! ```text
//! start:  buffer log → workers → buffer reader → persistence cycle
//!         → frame listener → metrics endpoint
//! stop:   frame listener → buffer reader → forwarding workers
//!         → persistence cycle (final tick) → terminal workers → metrics endpoint
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracehouse_cluster::{
    ClusterMembership, DispatchHandler, RemoteServer, Router, TcpRemoteSender,
};
use tracehouse_observability::{exporter, metrics};
use tracehouse_storage::{BufferLog, BufferReader, Dao, InMemoryDao, RecordSink};
use tracehouse_stream::{PersistenceCycle, WorkerRuntime};
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::ingest::InboundHandler;
use crate::pipeline::{self, PERSISTENCE_ROLE};

struct Task {
    name: &'static str,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Task {
    fn new(name: &'static str, shutdown_tx: oneshot::Sender<()>, handle: JoinHandle<()>) -> Self {
        Self {
            name,
            shutdown_tx,
            handle,
        }
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            warn!(task = self.name, error = %e, "Task panicked");
        }
    }
}

/// A running collector
pub struct Collector {
    listen_addr: SocketAddr,
    metrics_addr: SocketAddr,
    dao: Arc<InMemoryDao>,
    log: Arc<BufferLog>,
    membership: Arc<ClusterMembership>,
    listener: Task,
    reader: Task,
    persistence: Task,
    runtime: WorkerRuntime,
    metrics_server: Task,
}

impl Collector {
    pub async fn start(config: ServerConfig) -> Result<Self> {
        metrics::init();
        config.validate()?;

        let membership = Arc::new(ClusterMembership::new(
            config.cluster.self_address.clone(),
            config.cluster.virtual_nodes,
        ));
        membership.declare_role(PERSISTENCE_ROLE);
        for member in config.cluster.members() {
            membership.join(PERSISTENCE_ROLE, member);
        }
        let router = Arc::new(Router::new(Arc::clone(&membership), config.cluster.strategy));
        let sender = Arc::new(TcpRemoteSender::new(config.cluster.send_timeout));

        let mut pipeline = pipeline::build(&config.worker, router, sender)?;
        let dao = Arc::new(InMemoryDao::new());

        let log = Arc::new(BufferLog::open(config.buffer.clone()).await?);
        let reader = BufferReader::open(&config.buffer, log.subscribe()).await?;

        let workers = pipeline.runtime.start(&pipeline.graphs)?;

        let (reader_tx, reader_rx) = oneshot::channel();
        let sink: Arc<dyn RecordSink> = pipeline.dispatcher.clone();
        let reader = Task::new("buffer-reader", reader_tx, reader.start(sink, reader_rx));

        let cycle = Arc::new(PersistenceCycle::new(
            config.persistence.clone(),
            Arc::clone(&dao) as Arc<dyn Dao>,
            Arc::clone(&pipeline.schemas),
            std::mem::take(&mut pipeline.persistence_workers),
        ));
        let (cycle_tx, cycle_rx) = oneshot::channel();
        let persistence = Task::new("persistence-cycle", cycle_tx, cycle.start(cycle_rx));

        let handler = Arc::new(InboundHandler::new(
            Arc::clone(&log),
            Arc::clone(&pipeline.schemas),
            DispatchHandler::new(Arc::clone(&pipeline.graphs)),
        ));
        let server = RemoteServer::bind(&config.listen_addr, handler).await?;
        let listen_addr = server.local_addr()?;
        let (listener_tx, listener_rx) = oneshot::channel();
        let listener = Task::new("frame-listener", listener_tx, server.start(listener_rx));

        let metrics_listener = TcpListener::bind(&config.metrics_addr).await?;
        let metrics_addr = metrics_listener.local_addr()?;
        let (metrics_tx, metrics_rx) = oneshot::channel::<()>();
        let metrics_handle = tokio::spawn(async move {
            let result = axum::serve(metrics_listener, exporter::create_metrics_router())
                .with_graceful_shutdown(async {
                    metrics_rx.await.ok();
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, "Metrics server error");
            }
        });
        let metrics_server = Task::new("metrics-server", metrics_tx, metrics_handle);

        info!("Tracehouse collector started");
        info!("   Frames:      {}", listen_addr);
        info!("   Metrics:     http://{}/metrics", metrics_addr);
        info!("   Buffer:      {}", config.buffer.directory.display());
        info!("   Self:        {}", config.cluster.self_address);
        info!("   Workers:     {}", workers);

        Ok(Self {
            listen_addr,
            metrics_addr,
            dao,
            log,
            membership,
            listener,
            reader,
            persistence,
            runtime: pipeline.runtime,
            metrics_server,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn metrics_addr(&self) -> SocketAddr {
        self.metrics_addr
    }

    pub fn dao(&self) -> &Arc<InMemoryDao> {
        &self.dao
    }

    pub fn buffer_log(&self) -> &Arc<BufferLog> {
        &self.log
    }

    /// Membership table, for whatever discovers peers at runtime
    pub fn membership(&self) -> &Arc<ClusterMembership> {
        &self.membership
    }

    pub async fn shutdown(mut self) {
        info!("Stopping collector");
        self.listener.stop().await;
        self.reader.stop().await;
        // aggregation output must reach the persist windows before the final tick
        self.runtime.stop_forwarding().await;
        self.persistence.stop().await;
        self.runtime.shutdown().await;
        self.metrics_server.stop().await;
        info!("Collector stopped");
    }
}
