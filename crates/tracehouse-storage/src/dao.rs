//! DAO Contract
//!
//! The persistence cycle talks to storage only through [`Dao`]:
//!
//! ```text
//! get(schema, id) ──► Some(row) ──► merge ──► prepare_batch_update ─┐
//!                 └─► None ──────────────────► prepare_batch_insert ─┼─► batch_persistence(ops)
//! ```
//!
//! Write ops are opaque to the caller; each backend decides what a prepared
//! insert or update looks like. [`InMemoryDao`] backs tests and standalone
//! runs.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracehouse_core::{Record, SchemaId};
use tracing::debug;

/// A prepared, backend-specific write
pub trait WriteOp: Send + Sync + Debug {
    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
pub trait Dao: Send + Sync {
    /// Stored row for `(schema_id, id)`, where `id` is the record's storage id.
    async fn get(&self, schema_id: SchemaId, id: &str) -> Result<Option<Record>>;

    fn prepare_batch_insert(&self, record: &Record) -> Result<Box<dyn WriteOp>>;

    fn prepare_batch_update(&self, record: &Record) -> Result<Box<dyn WriteOp>>;

    /// Apply every op in one backend round trip.
    async fn batch_persistence(&self, ops: Vec<Box<dyn WriteOp>>) -> Result<()>;
}

/// Write op produced by [`InMemoryDao`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryWriteOp {
    Insert(Record),
    Update(Record),
}

impl WriteOp for MemoryWriteOp {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

type RowKey = (SchemaId, String);

/// HashMap-backed DAO
///
/// Batches are all-or-nothing: an insert that collides with an existing row
/// (or an update of a missing one) fails the whole batch.
#[derive(Debug, Default)]
pub struct InMemoryDao {
    rows: RwLock<HashMap<RowKey, Record>>,
    batches: AtomicUsize,
    unavailable: AtomicBool,
    reject_batches: AtomicBool,
}

impl InMemoryDao {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a backend outage: reads and batches fail while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail `batch_persistence` while set, leaving reads working.
    pub fn set_reject_batches(&self, reject: bool) {
        self.reject_batches.store(reject, Ordering::SeqCst);
    }

    /// Number of successful `batch_persistence` calls
    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub async fn row(&self, schema_id: SchemaId, id: &str) -> Option<Record> {
        self.rows
            .read()
            .await
            .get(&(schema_id, id.to_string()))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Dao("backend unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Dao for InMemoryDao {
    async fn get(&self, schema_id: SchemaId, id: &str) -> Result<Option<Record>> {
        self.check_available()?;
        Ok(self.row(schema_id, id).await)
    }

    fn prepare_batch_insert(&self, record: &Record) -> Result<Box<dyn WriteOp>> {
        Ok(Box::new(MemoryWriteOp::Insert(record.clone())))
    }

    fn prepare_batch_update(&self, record: &Record) -> Result<Box<dyn WriteOp>> {
        Ok(Box::new(MemoryWriteOp::Update(record.clone())))
    }

    async fn batch_persistence(&self, ops: Vec<Box<dyn WriteOp>>) -> Result<()> {
        self.check_available()?;
        if self.reject_batches.load(Ordering::SeqCst) {
            return Err(Error::Dao("batch rejected".to_string()));
        }

        let mut rows = self.rows.write().await;

        let mut staged: Vec<(RowKey, Record)> = Vec::with_capacity(ops.len());
        for op in &ops {
            let op = op
                .as_any()
                .downcast_ref::<MemoryWriteOp>()
                .ok_or_else(|| Error::Dao(format!("foreign write op {op:?}")))?;

            let (record, is_insert) = match op {
                MemoryWriteOp::Insert(record) => (record, true),
                MemoryWriteOp::Update(record) => (record, false),
            };
            let key = (record.schema_id, record.storage_id());
            let exists = rows.contains_key(&key) || staged.iter().any(|(k, _)| k == &key);

            if is_insert && exists {
                return Err(Error::Dao(format!("duplicate insert of {}", key.1)));
            }
            if !is_insert && !exists {
                return Err(Error::Dao(format!("update of missing row {}", key.1)));
            }
            staged.push((key, record.clone()));
        }

        let count = staged.len();
        rows.extend(staged);
        self.batches.fetch_add(1, Ordering::SeqCst);
        debug!(ops = count, "In-memory batch applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracehouse_core::Value;

    fn row(bucket: i64, calls: i64) -> Record {
        Record::new(10, "svc-a", bucket, vec![Value::Long(calls)])
    }

    #[tokio::test]
    async fn test_insert_then_update() {
        let dao = InMemoryDao::new();
        let ops = vec![dao.prepare_batch_insert(&row(1, 5)).unwrap()];
        dao.batch_persistence(ops).await.unwrap();

        assert_eq!(dao.get(10, "1_svc-a").await.unwrap(), Some(row(1, 5)));

        let ops = vec![dao.prepare_batch_update(&row(1, 12)).unwrap()];
        dao.batch_persistence(ops).await.unwrap();

        assert_eq!(dao.row(10, "1_svc-a").await, Some(row(1, 12)));
        assert_eq!(dao.batch_count(), 2);
        assert_eq!(dao.len().await, 1);
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let dao = InMemoryDao::new();
        let ops = vec![
            dao.prepare_batch_insert(&row(1, 1)).unwrap(),
            dao.prepare_batch_update(&row(2, 1)).unwrap(),
        ];
        assert!(dao.batch_persistence(ops).await.is_err());
        assert!(dao.is_empty().await);
        assert_eq!(dao.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_backend() {
        let dao = InMemoryDao::new();
        dao.set_unavailable(true);
        assert!(matches!(dao.get(10, "x").await, Err(Error::Dao(_))));

        let ops = vec![dao.prepare_batch_insert(&row(1, 1)).unwrap()];
        assert!(dao.batch_persistence(ops).await.is_err());

        dao.set_unavailable(false);
        assert!(dao.get(10, "x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejected_batches_keep_reads_working() {
        let dao = InMemoryDao::new();
        dao.set_reject_batches(true);
        assert!(dao.get(10, "1_svc-a").await.unwrap().is_none());

        let ops = vec![dao.prepare_batch_insert(&row(1, 1)).unwrap()];
        assert!(matches!(dao.batch_persistence(ops).await, Err(Error::Dao(_))));
        assert!(dao.is_empty().await);
        assert_eq!(dao.batch_count(), 0);
    }
}
