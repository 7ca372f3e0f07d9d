//! Disk-backed Buffer Log
//!
//! Every record accepted from an agent is appended here before it enters a
//! graph, so a restart never loses what was already acknowledged.
//!
//! ## Layout
//!
//! ```text
//! <directory>/
//!   data_20241018120000.dat     ← rotated, complete
//!   data_20241018120412.dat     ← current, appended under the mutex
//!   writer.offset               ← {"file_name": "data_20241018120412.dat", "offset": N}
//!   reader.offset               ← owned by BufferReader
//! ```
//!
//! ## Frame Format
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────────┐
//! │ Payload Size │ CRC32        │ Payload              │
//! │ (4 bytes LE) │ (4 bytes LE) │ (encoded Record)     │
//! └──────────────┴──────────────┴──────────────────────┘
//! ```
//!
//! ## Commit Protocol
//!
//! 1. write the frame at the committed offset, flush (and `fdatasync`)
//! 2. persist the advanced offset to `writer.offset`
//! 3. publish the new position on a `watch` channel for the reader
//!
//! A failure in 1 or 2 truncates the data file back to the last committed
//! offset and drops the record. On open, anything past the recorded offset is
//! an uncommitted tail and is truncated away.

use crate::config::{BufferConfig, SyncPolicy};
use crate::error::Result;
use crate::offset::{BufferPosition, OffsetFile, WRITER_OFFSET_FILE};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tracehouse_core::Record;
use tracehouse_observability::metrics::{
    BUFFER_BYTES_TOTAL, BUFFER_ROTATIONS_TOTAL, BUFFER_WRITES_TOTAL, BUFFER_WRITE_ERRORS_TOTAL,
};
use tracing::{debug, error, info, warn};

/// Size of the `[len][crc]` frame header
pub const FRAME_HEADER_LEN: usize = 8;

const DATA_FILE_PREFIX: &str = "data_";
const DATA_FILE_SUFFIX: &str = ".dat";
const TIMESTAMP_LEN: usize = 14;

pub(crate) fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Writer half of the buffer
pub struct BufferLog {
    config: BufferConfig,
    offset_file: OffsetFile,
    state: Mutex<WriterState>,
    committed_tx: watch::Sender<BufferPosition>,
}

struct WriterState {
    file: File,
    position: BufferPosition,
}

impl BufferLog {
    /// Resume at the offset recorded in `writer.offset`, or start a fresh file.
    pub async fn open(config: BufferConfig) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.directory).await?;

        let sync = config.sync_policy == SyncPolicy::Always;
        let offset_file = OffsetFile::new(&config.directory, WRITER_OFFSET_FILE);

        let recorded = offset_file.load().await?;
        let (file, position) = match recorded {
            Some(position) if config.directory.join(&position.file_name).exists() => {
                let path = config.directory.join(&position.file_name);
                let mut file = OpenOptions::new().write(true).open(&path).await?;
                let len = file.metadata().await?.len();

                let position = if len > position.offset {
                    warn!(
                        file = %position.file_name,
                        committed = position.offset,
                        len,
                        "Truncating uncommitted buffer tail"
                    );
                    file.set_len(position.offset).await?;
                    position
                } else if len < position.offset {
                    warn!(
                        file = %position.file_name,
                        committed = position.offset,
                        len,
                        "Data file shorter than committed offset, resuming at end of file"
                    );
                    let position = BufferPosition::new(position.file_name, len);
                    offset_file.store(&position, sync).await?;
                    position
                } else {
                    position
                };

                file.seek(SeekFrom::Start(position.offset)).await?;
                (file, position)
            }
            stale => {
                if let Some(position) = stale {
                    warn!(
                        file = %position.file_name,
                        "Writer offset names a missing data file, starting a new one"
                    );
                }
                let latest = list_data_files(&config.directory).await?.pop();
                let (file, name) = create_data_file(&config.directory, latest.as_deref()).await?;
                let position = BufferPosition::new(name, 0);
                offset_file.store(&position, sync).await?;
                (file, position)
            }
        };

        info!(
            directory = ?config.directory,
            file = %position.file_name,
            offset = position.offset,
            max_file_size = config.max_file_size,
            "Buffer log opened"
        );

        let (committed_tx, _) = watch::channel(position.clone());

        Ok(Self {
            config,
            offset_file,
            state: Mutex::new(WriterState { file, position }),
            committed_tx,
        })
    }

    /// Append one record and commit its offset.
    ///
    /// On error the data file is rolled back to the previous committed
    /// offset and the record is dropped.
    pub async fn write_buffer(&self, record: &Record) -> Result<()> {
        let frame = encode_frame(&record.to_bytes());

        let mut state = self.state.lock().await;
        let committed = state.position.offset;

        if let Err(e) = self.append_frame(&mut state, &frame).await {
            BUFFER_WRITE_ERRORS_TOTAL.inc();
            error!(
                file = %state.position.file_name,
                offset = committed,
                error = %e,
                "Buffer write failed, dropping record"
            );
            if let Err(truncate_err) = rollback(&mut state.file, committed).await {
                error!(
                    file = %state.position.file_name,
                    error = %truncate_err,
                    "Failed to truncate partial frame"
                );
            }
            return Err(e);
        }

        BUFFER_WRITES_TOTAL.inc();
        BUFFER_BYTES_TOTAL.inc_by(frame.len() as u64);
        self.committed_tx.send_replace(state.position.clone());

        if state.position.offset >= self.config.max_file_size {
            if let Err(e) = self.rotate(&mut state).await {
                warn!(
                    file = %state.position.file_name,
                    error = %e,
                    "Buffer rotation failed, retrying on next write"
                );
            }
        }

        Ok(())
    }

    async fn append_frame(&self, state: &mut WriterState, frame: &[u8]) -> Result<()> {
        state.file.write_all(frame).await?;
        state.file.flush().await?;
        if self.sync() {
            state.file.sync_data().await?;
        }

        let next = BufferPosition::new(
            state.position.file_name.clone(),
            state.position.offset + frame.len() as u64,
        );
        self.offset_file.store(&next, self.sync()).await?;
        state.position = next;
        Ok(())
    }

    async fn rotate(&self, state: &mut WriterState) -> Result<()> {
        let directory = &self.config.directory;
        let (file, name) = create_data_file(directory, Some(&state.position.file_name)).await?;

        let position = BufferPosition::new(name, 0);
        if let Err(e) = self.offset_file.store(&position, self.sync()).await {
            let _ = tokio::fs::remove_file(directory.join(&position.file_name)).await;
            return Err(e);
        }

        info!(
            from = %state.position.file_name,
            to = %position.file_name,
            size = state.position.offset,
            "Rotated buffer data file"
        );

        state.file = file;
        state.position = position;
        BUFFER_ROTATIONS_TOTAL.inc();
        self.committed_tx.send_replace(state.position.clone());
        Ok(())
    }

    fn sync(&self) -> bool {
        self.config.sync_policy == SyncPolicy::Always
    }

    /// Watch the committed write position
    pub fn subscribe(&self) -> watch::Receiver<BufferPosition> {
        self.committed_tx.subscribe()
    }

    pub fn committed(&self) -> BufferPosition {
        self.committed_tx.borrow().clone()
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }
}

async fn rollback(file: &mut File, committed: u64) -> Result<()> {
    file.set_len(committed).await?;
    file.seek(SeekFrom::Start(committed)).await?;
    Ok(())
}

pub(crate) fn is_data_file(name: &str) -> bool {
    name.starts_with(DATA_FILE_PREFIX) && name.ends_with(DATA_FILE_SUFFIX)
}

fn timestamp_part(name: &str) -> Option<&str> {
    name.strip_prefix(DATA_FILE_PREFIX)?.get(..TIMESTAMP_LEN)
}

/// Data file names in the directory, oldest first
pub(crate) async fn list_data_files(directory: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = match tokio::fs::read_dir(directory).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_data_file(&name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// First data file ordered after `current`
pub(crate) async fn next_data_file(directory: &Path, current: &str) -> Result<Option<String>> {
    Ok(list_data_files(directory)
        .await?
        .into_iter()
        .find(|name| name.as_str() > current))
}

/// Pick a name that sorts after `after` and does not exist yet.
///
/// Names are `data_<yyyyMMddHHmmss>.dat`; collisions within one second (or a
/// clock that went backwards) get a `_NNNN` suffix on the newest timestamp.
fn next_file_name(directory: &Path, after: Option<&str>) -> String {
    let now = chrono::Utc::now().format("%Y%m%d%H%M%S").to_string();
    let stamp = match after.and_then(timestamp_part) {
        Some(previous) if now.as_str() <= previous => previous.to_string(),
        _ => now,
    };

    let taken = |name: &str| {
        directory.join(name).exists() || after.is_some_and(|prev| name <= prev)
    };

    let mut name = format!("{DATA_FILE_PREFIX}{stamp}{DATA_FILE_SUFFIX}");
    let mut seq = 0u32;
    while taken(&name) {
        seq += 1;
        name = format!("{DATA_FILE_PREFIX}{stamp}_{seq:04}{DATA_FILE_SUFFIX}");
    }
    name
}

async fn create_data_file(directory: &Path, after: Option<&str>) -> Result<(File, String)> {
    let name = next_file_name(directory, after);
    let path: PathBuf = directory.join(&name);
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await?;
    debug!(path = ?path, "Created buffer data file");
    Ok((file, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tracehouse_core::Value;

    fn record(i: i64) -> Record {
        Record::new(1, format!("svc-{i}"), 202410181200, vec![Value::Long(i)])
    }

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(b"abc");
        assert_eq!(frame.len(), FRAME_HEADER_LEN + 3);
        assert_eq!(&frame[0..4], &3u32.to_le_bytes());
        assert_eq!(&frame[4..8], &crc32fast::hash(b"abc").to_le_bytes());
        assert_eq!(&frame[8..], b"abc");
    }

    #[test]
    fn test_next_file_name_orders_after_previous() {
        let dir = TempDir::new().unwrap();
        let first = next_file_name(dir.path(), None);
        assert!(is_data_file(&first));

        std::fs::write(dir.path().join(&first), b"").unwrap();
        let second = next_file_name(dir.path(), Some(&first));
        assert!(second > first, "{second} should sort after {first}");
    }

    #[test]
    fn test_next_file_name_with_future_previous() {
        let dir = TempDir::new().unwrap();
        let future = "data_29991231235959.dat";
        let next = next_file_name(dir.path(), Some(future));
        assert_eq!(next, "data_29991231235959_0001.dat");
    }

    #[tokio::test]
    async fn test_open_creates_file_and_offset() {
        let dir = TempDir::new().unwrap();
        let log = BufferLog::open(BufferConfig::new(dir.path())).await.unwrap();

        let committed = log.committed();
        assert_eq!(committed.offset, 0);
        assert!(dir.path().join(&committed.file_name).exists());

        let stored = OffsetFile::new(dir.path(), WRITER_OFFSET_FILE)
            .load()
            .await
            .unwrap();
        assert_eq!(stored, Some(committed));
    }

    #[tokio::test]
    async fn test_write_advances_committed_offset() {
        let dir = TempDir::new().unwrap();
        let log = BufferLog::open(BufferConfig::new(dir.path())).await.unwrap();
        let mut rx = log.subscribe();

        let rec = record(1);
        log.write_buffer(&rec).await.unwrap();

        rx.changed().await.unwrap();
        let expected = (FRAME_HEADER_LEN + rec.encoded_len()) as u64;
        assert_eq!(rx.borrow().offset, expected);

        let len = std::fs::metadata(dir.path().join(&log.committed().file_name))
            .unwrap()
            .len();
        assert_eq!(len, expected);
    }

    #[tokio::test]
    async fn test_reopen_truncates_uncommitted_tail() {
        let dir = TempDir::new().unwrap();
        let committed = {
            let log = BufferLog::open(BufferConfig::new(dir.path())).await.unwrap();
            log.write_buffer(&record(1)).await.unwrap();
            log.committed()
        };

        // half-written frame after the committed offset
        let path = dir.path().join(&committed.file_name);
        let mut data = std::fs::read(&path).unwrap();
        data.extend_from_slice(&[0xAB; 5]);
        std::fs::write(&path, &data).unwrap();

        let log = BufferLog::open(BufferConfig::new(dir.path())).await.unwrap();
        assert_eq!(log.committed(), committed);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), committed.offset);

        log.write_buffer(&record(2)).await.unwrap();
        assert!(log.committed().offset > committed.offset);
    }

    #[tokio::test]
    async fn test_missing_data_file_starts_fresh() {
        let dir = TempDir::new().unwrap();
        OffsetFile::new(dir.path(), WRITER_OFFSET_FILE)
            .store(&BufferPosition::new("data_20000101000000.dat", 99), false)
            .await
            .unwrap();

        let log = BufferLog::open(BufferConfig::new(dir.path())).await.unwrap();
        assert_eq!(log.committed().offset, 0);
        assert_ne!(log.committed().file_name, "data_20000101000000.dat");
    }
}
