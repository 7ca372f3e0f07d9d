//! Persistence Cycle
//!
//! A single timer drains every persistence worker into one batched DAO write.
//!
//! ## Tick
//!
//! ```text
//! Idle ──► SignalFlush ──► Collect ──► Write ──► Idle
//!            │               │            │
//!            │               │            └─ batch_persistence(ops), once, skipped if empty
//!            │               └─ get(schema, id): merge + update, or insert
//!            └─ EndOfBatch{reply} to each worker, bounded wait
//! ```
//!
//! Ticks never overlap: the loop awaits each tick before the next interval
//! fires (`MissedTickBehavior::Delay`). A failed DAO write drops that tick's
//! batch after logging and counting it. Shutdown runs one final tick.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracehouse_core::{Record, SchemaRegistry};
use tracehouse_observability::metrics::{
    PERSISTENCE_ERRORS_TOTAL, PERSISTENCE_OPS_TOTAL, PERSISTENCE_TICKS_TOTAL,
    PERSISTENCE_TICK_LATENCY,
};
use tracehouse_storage::{Dao, WriteOp};
use tracing::{debug, error, info, warn};

use crate::aggregation::AggregationCache;
use crate::error::Result;
use crate::worker::WorkerHandle;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_interval", with = "duration_ms")]
    pub interval: Duration,

    /// Longest wait for one worker to answer EndOfBatch
    #[serde(default = "default_flush_timeout", with = "duration_ms")]
    pub flush_timeout: Duration,
}

fn default_interval() -> Duration {
    Duration::from_millis(3000)
}

fn default_flush_timeout() -> Duration {
    Duration::from_millis(1000)
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            flush_timeout: default_flush_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    SignalFlush,
    Collect,
    Write,
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub workers_flushed: usize,
    pub workers_failed: usize,
    pub accumulators: usize,
    pub inserts: usize,
    pub updates: usize,
    /// Whether `batch_persistence` was called
    pub batch_submitted: bool,
    pub error: Option<String>,
}

pub struct PersistenceCycle {
    config: PersistenceConfig,
    dao: Arc<dyn Dao>,
    schemas: Arc<SchemaRegistry>,
    workers: Vec<WorkerHandle>,
    state: Mutex<CycleState>,
}

impl PersistenceCycle {
    pub fn new(
        config: PersistenceConfig,
        dao: Arc<dyn Dao>,
        schemas: Arc<SchemaRegistry>,
        workers: Vec<WorkerHandle>,
    ) -> Self {
        Self {
            config,
            dao,
            schemas,
            workers,
            state: Mutex::new(CycleState::Idle),
        }
    }

    pub fn state(&self) -> CycleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self, state: CycleState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Run one flush-collect-write round.
    pub async fn tick(&self) -> TickReport {
        let started = Instant::now();
        let mut report = TickReport::default();
        PERSISTENCE_TICKS_TOTAL.inc();

        self.enter(CycleState::SignalFlush);
        let drained = self.signal_flush(&mut report).await;

        self.enter(CycleState::Collect);
        let ops = self.collect(drained, &mut report).await;

        self.enter(CycleState::Write);
        if !ops.is_empty() {
            report.batch_submitted = true;
            let count = ops.len();
            match self.dao.batch_persistence(ops).await {
                Ok(()) => {
                    PERSISTENCE_OPS_TOTAL
                        .with_label_values(&["insert"])
                        .inc_by(report.inserts as u64);
                    PERSISTENCE_OPS_TOTAL
                        .with_label_values(&["update"])
                        .inc_by(report.updates as u64);
                    debug!(ops = count, "Persistence batch written");
                }
                Err(e) => {
                    PERSISTENCE_ERRORS_TOTAL.with_label_values(&["batch"]).inc();
                    error!(ops = count, error = %e, "Persistence batch failed, dropping it");
                    report.error = Some(e.to_string());
                }
            }
        }

        self.enter(CycleState::Idle);
        PERSISTENCE_TICK_LATENCY.observe(started.elapsed().as_secs_f64());
        report
    }

    async fn signal_flush(&self, report: &mut TickReport) -> Vec<Record> {
        let timeout = self.config.flush_timeout;
        let replies = join_all(self.workers.iter().map(|w| w.end_of_batch(timeout))).await;

        let mut drained = Vec::new();
        for (worker, reply) in self.workers.iter().zip(replies) {
            match reply {
                Ok(records) => {
                    report.workers_flushed += 1;
                    drained.extend(records);
                }
                Err(e) => {
                    report.workers_failed += 1;
                    PERSISTENCE_ERRORS_TOTAL.with_label_values(&["flush"]).inc();
                    warn!(worker = %worker.name(), error = %e, "Worker did not flush");
                }
            }
        }
        drained
    }

    async fn collect(&self, drained: Vec<Record>, report: &mut TickReport) -> Vec<Box<dyn WriteOp>> {
        // two workers may hold the same key
        let mut merged = AggregationCache::new(Arc::clone(&self.schemas));
        for record in drained {
            if let Err(e) = merged.aggregate(record) {
                PERSISTENCE_ERRORS_TOTAL.with_label_values(&["prepare"]).inc();
                warn!(error = %e, "Dropping invalid accumulator");
            }
        }

        let accumulators = merged.drain();
        report.accumulators = accumulators.len();

        let mut ops = Vec::with_capacity(accumulators.len());
        for acc in accumulators {
            match self.prepare(&acc).await {
                Ok((op, is_update)) => {
                    if is_update {
                        report.updates += 1;
                    } else {
                        report.inserts += 1;
                    }
                    ops.push(op);
                }
                Err(e) => {
                    PERSISTENCE_ERRORS_TOTAL.with_label_values(&["prepare"]).inc();
                    warn!(
                        schema = acc.schema_id,
                        id = %acc.storage_id(),
                        error = %e,
                        "Could not prepare write, dropping accumulator"
                    );
                }
            }
        }
        ops
    }

    async fn prepare(&self, acc: &Record) -> Result<(Box<dyn WriteOp>, bool)> {
        match self.dao.get(acc.schema_id, &acc.storage_id()).await? {
            Some(mut stored) => {
                let schema = self.schemas.get(acc.schema_id)?;
                schema.merge(&mut stored, acc)?;
                Ok((self.dao.prepare_batch_update(&stored)?, true))
            }
            None => Ok((self.dao.prepare_batch_insert(acc)?, false)),
        }
    }

    /// Tick on the configured interval until `shutdown_rx` fires, then tick once more.
    pub fn start(self: Arc<Self>, mut shutdown_rx: oneshot::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            info!(
                interval_ms = self.config.interval.as_millis() as u64,
                workers = self.workers.len(),
                "Persistence cycle started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.tick().await;
                        if report.batch_submitted {
                            debug!(?report, "Persistence tick");
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("Persistence cycle shutting down, running final tick");
                        let report = self.tick().await;
                        info!(?report, "Final persistence tick");
                        break;
                    }
                }
            }
        })
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
