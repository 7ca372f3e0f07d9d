//! Local Workers
//!
//! A local worker puts one stage of a graph on its own task. The graph holds
//! the producer half ([`LocalWorkerRef`], a [`NodeProcessor`] that only
//! enqueues); the [`WorkerRunner`] owns the stage state and is spawned by the
//! [`WorkerRuntime`] once every graph is registered.
//!
//! ```text
//! Graph ──process()──► LocalWorkerRef ──save──► Channels ──drain──► WorkerRunner
//!                                                                  │  on_work(record)...
//!                                                                  │  on_end_of_batch()
//!                                                                  └──► Next::execute(output)
//!
//! PersistenceCycle ──EndOfBatch{reply}──► command channel ──► WorkerRunner
//! ```
//!
//! Control commands travel on their own channel so admission policies never
//! drop them, and the handler is only touched by the runner task, so stage
//! state needs no locks.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracehouse_core::Record;
use tracehouse_observability::metrics::{WORKER_ERRORS_TOTAL, WORKER_RECORDS_TOTAL};
use tracing::{debug, info, warn};

use crate::channel::{Admission, ChannelConfig, Channels, PartitionSelector};
use crate::error::{Result, StreamError};
use crate::graph::{GraphId, GraphRegistry, Next, NodeId, NodeProcessor};

const COMMAND_BUFFER: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Records between forced flushes inside aggregating stages
    #[serde(default = "default_force_flush_count")]
    pub force_flush_count: usize,
}

fn default_force_flush_count() -> usize {
    100
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        self.channel.validate()?;
        if self.channel.selector == PartitionSelector::RoundRobin && self.channel.partitions > 1 {
            return Err(StreamError::InvalidConfig(
                "round_robin selector needs a single partition per worker".to_string(),
            ));
        }
        if self.force_flush_count == 0 {
            return Err(StreamError::InvalidConfig(
                "force_flush_count must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            force_flush_count: default_force_flush_count(),
        }
    }
}

/// Stage logic run by a worker's consumer task
pub trait WorkHandler: Send + Sync + 'static {
    fn on_work(&mut self, record: Record, out: &mut Vec<Record>) -> Result<()>;

    /// Called after every drained batch.
    fn on_end_of_batch(&mut self, out: &mut Vec<Record>) -> Result<()>;

    /// State handed back to an `EndOfBatch` command.
    fn take_pending(&mut self) -> Vec<Record> {
        Vec::new()
    }

    /// Take back state from [`take_pending`](Self::take_pending) that never
    /// reached the requester. Handlers overriding one override both.
    fn restore_pending(&mut self, _pending: Vec<Record>) -> Result<()> {
        Ok(())
    }
}

pub enum WorkerCommand {
    EndOfBatch {
        reply: oneshot::Sender<Vec<Record>>,
    },
}

/// Producer half of a local worker, placed in the graph
pub struct LocalWorkerRef {
    id: NodeId,
    name: String,
    channels: Arc<Channels<Record>>,
    commands: mpsc::Sender<WorkerCommand>,
}

impl LocalWorkerRef {
    /// Create the producer half and its runner.
    pub fn new(
        id: NodeId,
        name: impl Into<String>,
        handler: impl WorkHandler,
        config: &ChannelConfig,
    ) -> Result<(Arc<Self>, WorkerRunner)> {
        let name = name.into();
        if config.selector == PartitionSelector::RoundRobin && config.partitions > 1 {
            // one key spread over partitions would merge out of arrival order
            return Err(StreamError::InvalidConfig(format!(
                "worker {name}: round_robin selector needs a single partition"
            )));
        }
        let channels = Arc::new(Channels::new(name.clone(), config)?);
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);

        let worker = Arc::new(Self {
            id,
            name: name.clone(),
            channels: Arc::clone(&channels),
            commands,
        });
        let runner = WorkerRunner {
            node_id: id,
            name,
            channels,
            commands: command_rx,
            handler: Box::new(handler),
        };
        Ok((worker, runner))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue `record`, partitioned by its aggregation key.
    pub async fn allocate_job(&self, record: Record) -> Result<Admission> {
        let mut hasher = DefaultHasher::new();
        record.id.hash(&mut hasher);
        record.time_bucket.hash(&mut hasher);
        self.channels.save(hasher.finish(), record).await
    }

    /// Control handle for the persistence cycle.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            name: self.name.clone(),
            commands: self.commands.clone(),
        }
    }

    pub fn queued(&self) -> usize {
        self.channels.len()
    }
}

#[async_trait]
impl NodeProcessor for LocalWorkerRef {
    fn id(&self) -> NodeId {
        self.id
    }

    async fn process(&self, input: Record, _next: &Next) -> Result<()> {
        match self.allocate_job(input).await? {
            Admission::Dropped => debug!(worker = %self.name, "Channel full, record dropped"),
            Admission::Overwrote => debug!(worker = %self.name, "Channel full, oldest record overwritten"),
            Admission::Accepted => {}
        }
        Ok(())
    }
}

/// Command side of a worker
#[derive(Clone)]
pub struct WorkerHandle {
    name: String,
    commands: mpsc::Sender<WorkerCommand>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the worker to finish its batch and return its pending state.
    pub async fn end_of_batch(&self, timeout: Duration) -> Result<Vec<Record>> {
        let (reply, rx) = oneshot::channel();
        let exchange = async {
            self.commands
                .send(WorkerCommand::EndOfBatch { reply })
                .await
                .map_err(|_| StreamError::WorkerClosed(self.name.clone()))?;
            rx.await
                .map_err(|_| StreamError::WorkerClosed(self.name.clone()))
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| StreamError::WorkerTimeout(self.name.clone()))?
    }
}

/// Consumer half of a local worker
pub struct WorkerRunner {
    node_id: NodeId,
    name: String,
    channels: Arc<Channels<Record>>,
    commands: mpsc::Receiver<WorkerCommand>,
    handler: Box<dyn WorkHandler>,
}

impl WorkerRunner {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Spawn the consumer loop, forwarding output into `next`.
    pub fn start(mut self, next: Next, mut shutdown_rx: oneshot::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(worker = %self.name, node = self.node_id, downstream = ?next.ids(), "Worker started");

            loop {
                tokio::select! {
                    biased;

                    _ = &mut shutdown_rx => {
                        break;
                    }
                    Some(command) = self.commands.recv() => {
                        self.handle_command(command, &next).await;
                    }
                    _ = self.channels.wait_for_data() => {
                        self.run_batch(&next).await;
                    }
                }
            }

            self.channels.close();
            self.run_batch(&next).await;
            info!(worker = %self.name, "Worker stopped");
        })
    }

    async fn run_batch(&mut self, next: &Next) {
        let mut batch = Vec::new();
        if self.channels.drain_into(&mut batch) == 0 {
            return;
        }

        WORKER_RECORDS_TOTAL
            .with_label_values(&[self.name.as_str()])
            .inc_by(batch.len() as u64);

        let mut out = Vec::new();
        for record in batch {
            if let Err(e) = self.handler.on_work(record, &mut out) {
                count_error(&self.name, &e, "Stage rejected record");
            }
        }
        if let Err(e) = self.handler.on_end_of_batch(&mut out) {
            count_error(&self.name, &e, "End of batch failed");
        }

        forward(&self.name, out, next).await;
    }

    async fn handle_command(&mut self, command: WorkerCommand, next: &Next) {
        match command {
            WorkerCommand::EndOfBatch { reply } => {
                // queued data belongs to the batch being closed
                self.run_batch(next).await;
                if reply.is_closed() {
                    // requester timed out, the next EndOfBatch gets this window
                    debug!(worker = %self.name, "End of batch requester went away, keeping pending state");
                    return;
                }
                let pending = self.handler.take_pending();
                debug!(worker = %self.name, pending = pending.len(), "End of batch requested");
                if let Err(pending) = reply.send(pending) {
                    debug!(worker = %self.name, pending = pending.len(), "End of batch requester went away, restoring pending state");
                    if let Err(e) = self.handler.restore_pending(pending) {
                        count_error(&self.name, &e, "Pending state could not be restored");
                    }
                }
            }
        }
    }
}

async fn forward(name: &str, out: Vec<Record>, next: &Next) {
    for record in out {
        if let Err(e) = next.execute(record).await {
            count_error(name, &e, "Downstream stage failed");
        }
    }
}

fn count_error(name: &str, error: &StreamError, message: &str) {
    WORKER_ERRORS_TOTAL.with_label_values(&[name]).inc();
    warn!(worker = %name, error = %error, "{message}");
}

struct RunningWorker {
    name: String,
    /// Whether the worker forwards output to downstream nodes
    forwarding: bool,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl RunningWorker {
    async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            warn!(worker = %self.name, error = %e, "Worker task panicked");
        }
    }
}

/// Spawns and stops every worker runner
///
/// Shutdown has two phases around the final persistence tick:
///
/// ```text
/// stop_forwarding()  forwarding workers flush their last batch downstream
/// (final persistence tick collects terminal workers' windows)
/// shutdown()         terminal workers stop
/// ```
#[derive(Default)]
pub struct WorkerRuntime {
    pending: Vec<(GraphId, WorkerRunner)>,
    running: Vec<RunningWorker>,
}

impl WorkerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a runner whose node lives in `graph_id`.
    pub fn register(&mut self, graph_id: GraphId, runner: WorkerRunner) {
        self.pending.push((graph_id, runner));
    }

    /// Resolve each runner's downstream nodes and spawn it.
    pub fn start(&mut self, registry: &GraphRegistry) -> Result<usize> {
        let mut resolved = Vec::with_capacity(self.pending.len());
        for (graph_id, runner) in &self.pending {
            resolved.push(registry.find_next(*graph_id, runner.node_id)?);
        }

        for ((_, runner), next) in self.pending.drain(..).zip(resolved) {
            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            let name = runner.name.clone();
            let forwarding = !next.is_empty();
            let handle = runner.start(next, shutdown_rx);
            self.running.push(RunningWorker {
                name,
                forwarding,
                shutdown_tx,
                handle,
            });
        }

        info!(workers = self.running.len(), "Worker runtime started");
        Ok(self.running.len())
    }

    /// Stop every worker with downstream nodes, in registration order, after
    /// it forwarded its last batch. Terminal workers keep running.
    pub async fn stop_forwarding(&mut self) {
        let (forwarding, terminal): (Vec<_>, Vec<_>) =
            self.running.drain(..).partition(|w| w.forwarding);
        self.running = terminal;
        for worker in forwarding {
            worker.stop().await;
        }
    }

    /// Stop every worker after its current batch.
    pub async fn shutdown(&mut self) {
        self.stop_forwarding().await;
        for worker in self.running.drain(..) {
            worker.stop().await;
        }
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }
}
