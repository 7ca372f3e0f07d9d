//! Buffer Reader
//!
//! Tails the buffer log and re-emits records into the graphs. The reader
//! keeps its own position in `reader.offset` and never reads past the
//! writer's committed position, which it learns through a `watch` channel, so
//! reading and writing run concurrently without sharing a lock.
//!
//! ```text
//! data_A.dat  [frame][frame][frame]          ← rotated: read to EOF, then move on
//! data_B.dat  [frame][frame]|                ← current: read up to committed offset
//!                    ^reader ^committed
//! ```
//!
//! Corrupt frames (CRC mismatch or undecodable payload) are skipped. A torn
//! frame at the end of a rotated file ends that file.

use crate::buffer::{list_data_files, next_data_file, FRAME_HEADER_LEN};
use crate::config::{BufferConfig, SyncPolicy};
use crate::error::Result;
use crate::offset::{BufferPosition, OffsetFile, READER_OFFSET_FILE};
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracehouse_core::Record;
use tracehouse_observability::metrics::{BUFFER_CORRUPT_FRAMES_TOTAL, BUFFER_RECORDS_READ_TOTAL};
use tracing::{debug, error, info, warn};

pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Destination for replayed records, usually the graph dispatcher
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn accept(&self, record: Record) -> std::result::Result<(), SinkError>;
}

pub struct BufferReader {
    directory: PathBuf,
    offset_file: OffsetFile,
    position: BufferPosition,
    committed: watch::Receiver<BufferPosition>,
    sync: bool,
    batch_size: usize,
    read_interval: Duration,
}

impl BufferReader {
    /// Resume from `reader.offset`, or from the oldest data file.
    pub async fn open(
        config: &BufferConfig,
        committed: watch::Receiver<BufferPosition>,
    ) -> Result<Self> {
        let directory = config.directory.clone();
        let offset_file = OffsetFile::new(&directory, READER_OFFSET_FILE);
        let writer_file = committed.borrow().file_name.clone();

        let position = match offset_file.load().await? {
            Some(position) if directory.join(&position.file_name).exists() => position,
            Some(stale) => {
                let next = next_data_file(&directory, &stale.file_name)
                    .await?
                    .unwrap_or(writer_file);
                warn!(
                    missing = %stale.file_name,
                    resume = %next,
                    "Reader offset names a missing data file"
                );
                BufferPosition::new(next, 0)
            }
            None => {
                let first = list_data_files(&directory)
                    .await?
                    .into_iter()
                    .next()
                    .unwrap_or(writer_file);
                BufferPosition::new(first, 0)
            }
        };

        info!(
            file = %position.file_name,
            offset = position.offset,
            "Buffer reader opened"
        );

        Ok(Self {
            directory,
            offset_file,
            position,
            committed,
            sync: config.sync_policy == SyncPolicy::Always,
            batch_size: config.read_batch_size,
            read_interval: config.read_interval,
        })
    }

    pub fn position(&self) -> &BufferPosition {
        &self.position
    }

    /// Read up to `max` committed records past the read position.
    ///
    /// The position advances in memory only; call [`commit`](Self::commit)
    /// once the records have been handed off.
    pub async fn read_batch(&mut self, max: usize) -> Result<Vec<Record>> {
        let mut records = Vec::new();

        while records.len() < max {
            let committed = self.committed.borrow().clone();
            let on_writer_file = self.position.file_name == committed.file_name;
            let path = self.directory.join(&self.position.file_name);

            let limit = if on_writer_file {
                committed.offset
            } else {
                match tokio::fs::metadata(&path).await {
                    Ok(meta) => meta.len(),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                    Err(e) => return Err(e.into()),
                }
            };

            if self.position.offset < limit {
                self.read_frames(&path, limit, max, &mut records).await?;
            }

            if self.position.offset < limit {
                // batch is full
                break;
            }
            if on_writer_file {
                break;
            }

            match next_data_file(&self.directory, &self.position.file_name).await? {
                Some(next) => {
                    debug!(from = %self.position.file_name, to = %next, "Reader moving to next data file");
                    self.position = BufferPosition::new(next, 0);
                }
                None => break,
            }
        }

        BUFFER_RECORDS_READ_TOTAL.inc_by(records.len() as u64);
        Ok(records)
    }

    async fn read_frames(
        &mut self,
        path: &Path,
        limit: u64,
        max: usize,
        out: &mut Vec<Record>,
    ) -> Result<()> {
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(SeekFrom::Start(self.position.offset)).await?;
        let mut reader = BufReader::new(file);

        while out.len() < max && self.position.offset < limit {
            if self.position.offset + FRAME_HEADER_LEN as u64 > limit {
                self.skip_torn_tail(limit);
                break;
            }

            let mut header = [0u8; FRAME_HEADER_LEN];
            reader.read_exact(&mut header).await?;
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let stored_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

            let frame_end = self.position.offset + FRAME_HEADER_LEN as u64 + u64::from(len);
            if frame_end > limit {
                self.skip_torn_tail(limit);
                break;
            }

            let mut payload = vec![0u8; len as usize];
            reader.read_exact(&mut payload).await?;
            let frame_offset = self.position.offset;
            self.position.offset = frame_end;

            if crc32fast::hash(&payload) != stored_crc {
                BUFFER_CORRUPT_FRAMES_TOTAL.inc();
                warn!(
                    file = %self.position.file_name,
                    offset = frame_offset,
                    "Corrupted buffer frame (CRC mismatch), skipping"
                );
                continue;
            }

            match Record::from_bytes(&payload) {
                Ok(record) => out.push(record),
                Err(e) => {
                    BUFFER_CORRUPT_FRAMES_TOTAL.inc();
                    warn!(
                        file = %self.position.file_name,
                        offset = frame_offset,
                        error = %e,
                        "Undecodable buffer frame, skipping"
                    );
                }
            }
        }

        Ok(())
    }

    fn skip_torn_tail(&mut self, limit: u64) {
        BUFFER_CORRUPT_FRAMES_TOTAL.inc();
        warn!(
            file = %self.position.file_name,
            offset = self.position.offset,
            limit,
            "Partial frame at end of data file, skipping tail"
        );
        self.position.offset = limit;
    }

    /// Persist the read position to `reader.offset`.
    pub async fn commit(&self) -> Result<()> {
        self.offset_file.store(&self.position, self.sync).await
    }

    /// Tail the log on an interval, handing every record to `sink`.
    pub fn start(
        mut self,
        sink: Arc<dyn RecordSink>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.read_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                interval_ms = self.read_interval.as_millis() as u64,
                batch_size = self.batch_size,
                "Buffer reader started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.drain(sink.as_ref()).await;
                    }
                    _ = &mut shutdown_rx => {
                        info!("Buffer reader shutting down");
                        break;
                    }
                }
            }

            if let Err(e) = self.commit().await {
                error!(error = %e, "Failed to commit reader offset on shutdown");
            }
        })
    }

    /// Replay everything currently committed, one batch at a time.
    async fn drain(&mut self, sink: &dyn RecordSink) {
        loop {
            let records = match self.read_batch(self.batch_size).await {
                Ok(records) => records,
                Err(e) => {
                    error!(file = %self.position.file_name, error = %e, "Buffer read failed");
                    return;
                }
            };
            if records.is_empty() {
                return;
            }

            let count = records.len();
            for record in records {
                if let Err(e) = sink.accept(record).await {
                    warn!(error = %e, "Sink rejected replayed record, dropping");
                }
            }

            if let Err(e) = self.commit().await {
                error!(error = %e, "Failed to commit reader offset");
            }

            if count < self.batch_size {
                return;
            }
        }
    }
}
