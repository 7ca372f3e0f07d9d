//! Aggregation
//!
//! [`AggregationCache`] keeps one accumulator per `(schema, id, time_bucket)`
//! and merges incoming records into it with the schema's per-field merge
//! ops. Two stage handlers sit on top of it:
//!
//! - [`AggregationWorker`]: emits every accumulator downstream at the end of
//!   each batch, or sooner once `force_flush_count` records were absorbed
//! - [`PersistenceWorker`]: keeps a [`WindowCache`] and hands the closed
//!   window to the persistence cycle when asked
//!
//! ```text
//!              switch()                 EndOfBatch
//! records ──► [current] ──merge──► [last] ──drain──► PersistenceCycle
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tracehouse_core::{AggregationKey, Record, SchemaId, SchemaRegistry};

use crate::error::Result;
use crate::worker::WorkHandler;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    schema_id: SchemaId,
    key: AggregationKey,
}

pub struct AggregationCache {
    schemas: Arc<SchemaRegistry>,
    entries: HashMap<CacheKey, Record>,
}

impl AggregationCache {
    pub fn new(schemas: Arc<SchemaRegistry>) -> Self {
        Self {
            schemas,
            entries: HashMap::new(),
        }
    }

    /// Merge `record` into its accumulator, or make it the accumulator.
    pub fn aggregate(&mut self, record: Record) -> Result<()> {
        let schema = self.schemas.get(record.schema_id)?;
        schema.validate(&record)?;

        let key = CacheKey {
            schema_id: record.schema_id,
            key: record.aggregation_key(),
        };
        match self.entries.get_mut(&key) {
            Some(acc) => schema.merge(acc, &record)?,
            None => {
                self.entries.insert(key, record);
            }
        }
        Ok(())
    }

    /// Take every accumulator, leaving the cache empty.
    pub fn drain(&mut self) -> Vec<Record> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Current window plus the closed window awaiting persistence
pub struct WindowCache {
    current: AggregationCache,
    last: AggregationCache,
}

impl WindowCache {
    pub fn new(schemas: Arc<SchemaRegistry>) -> Self {
        Self {
            current: AggregationCache::new(Arc::clone(&schemas)),
            last: AggregationCache::new(schemas),
        }
    }

    pub fn aggregate(&mut self, record: Record) -> Result<()> {
        self.current.aggregate(record)
    }

    /// Fold the current window into the closed one.
    pub fn switch(&mut self) -> Result<()> {
        for record in self.current.drain() {
            self.last.aggregate(record)?;
        }
        Ok(())
    }

    pub fn drain_last(&mut self) -> Vec<Record> {
        self.last.drain()
    }

    /// Put back a closed window taken by [`drain_last`](Self::drain_last)
    /// before anything newer was switched in.
    pub fn restore_last(&mut self, records: Vec<Record>) -> Result<()> {
        for record in records {
            self.last.aggregate(record)?;
        }
        Ok(())
    }

    pub fn current_len(&self) -> usize {
        self.current.len()
    }

    pub fn last_len(&self) -> usize {
        self.last.len()
    }
}

pub struct AggregationWorker {
    cache: AggregationCache,
    force_flush_count: usize,
    since_flush: usize,
}

impl AggregationWorker {
    pub fn new(schemas: Arc<SchemaRegistry>, force_flush_count: usize) -> Self {
        Self {
            cache: AggregationCache::new(schemas),
            force_flush_count: force_flush_count.max(1),
            since_flush: 0,
        }
    }

    fn flush(&mut self, out: &mut Vec<Record>) {
        out.extend(self.cache.drain());
        self.since_flush = 0;
    }
}

impl WorkHandler for AggregationWorker {
    fn on_work(&mut self, record: Record, out: &mut Vec<Record>) -> Result<()> {
        self.cache.aggregate(record)?;
        self.since_flush += 1;
        if self.since_flush >= self.force_flush_count {
            self.flush(out);
        }
        Ok(())
    }

    fn on_end_of_batch(&mut self, out: &mut Vec<Record>) -> Result<()> {
        self.flush(out);
        Ok(())
    }
}

pub struct PersistenceWorker {
    window: WindowCache,
    switch_count: usize,
    since_switch: usize,
}

impl PersistenceWorker {
    pub fn new(schemas: Arc<SchemaRegistry>, switch_count: usize) -> Self {
        Self {
            window: WindowCache::new(schemas),
            switch_count: switch_count.max(1),
            since_switch: 0,
        }
    }

    fn switch(&mut self) -> Result<()> {
        self.since_switch = 0;
        self.window.switch()
    }
}

impl WorkHandler for PersistenceWorker {
    fn on_work(&mut self, record: Record, _out: &mut Vec<Record>) -> Result<()> {
        self.window.aggregate(record)?;
        self.since_switch += 1;
        if self.since_switch >= self.switch_count {
            self.switch()?;
        }
        Ok(())
    }

    fn on_end_of_batch(&mut self, _out: &mut Vec<Record>) -> Result<()> {
        Ok(())
    }

    fn take_pending(&mut self) -> Vec<Record> {
        if let Err(e) = self.switch() {
            tracing::warn!(error = %e, "Window switch failed, closing window without it");
        }
        self.window.drain_last()
    }

    fn restore_pending(&mut self, pending: Vec<Record>) -> Result<()> {
        self.window.restore_last(pending)
    }
}
