//! Offset Files
//!
//! Both the writer and the reader remember where they are with a tiny JSON
//! document:
//!
//! ```text
//! {"file_name": "data_20241018120000.dat", "offset": 4096}
//! ```
//!
//! Updates go to `<name>.tmp` first and are renamed over the real file, so a
//! crash leaves either the old position or the new one, never a torn mix.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub const WRITER_OFFSET_FILE: &str = "writer.offset";
pub const READER_OFFSET_FILE: &str = "reader.offset";

/// A byte position inside one data file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferPosition {
    pub file_name: String,
    pub offset: u64,
}

impl BufferPosition {
    pub fn new(file_name: impl Into<String>, offset: u64) -> Self {
        Self {
            file_name: file_name.into(),
            offset,
        }
    }
}

/// Handle on one offset file
#[derive(Debug, Clone)]
pub struct OffsetFile {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl OffsetFile {
    pub fn new(directory: &Path, name: &str) -> Self {
        Self {
            path: directory.join(name),
            tmp_path: directory.join(format!("{name}.tmp")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last persisted position, or `None` if the file was never written.
    pub async fn load(&self) -> Result<Option<BufferPosition>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| Error::CorruptOffset {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })
    }

    pub async fn store(&self, position: &BufferPosition, sync: bool) -> Result<()> {
        let data = serde_json::to_vec(position).map_err(|e| Error::CorruptOffset {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut file = tokio::fs::File::create(&self.tmp_path).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        if sync {
            file.sync_data().await?;
        }
        drop(file);

        tokio::fs::rename(&self.tmp_path, &self.path).await?;
        Ok(())
    }
}
