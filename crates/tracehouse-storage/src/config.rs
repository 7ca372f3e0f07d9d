//! Buffer Configuration
//!
//! ## BufferConfig
//!
//! - **directory**: where `data_*.dat`, `writer.offset` and `reader.offset` live
//! - **max_file_size**: rotate the data file once it reaches this size (default: 10MB)
//! - **sync_policy**: whether every append is followed by `fdatasync`
//! - **read_batch_size**: records the reader hands downstream per poll (default: 500)
//! - **read_interval**: how often the reader polls for new frames (default: 100ms)
//!
//! Sizes accept human-friendly strings via [`parse_size`]:
//!
//! ```ignore
//! assert_eq!(parse_size("10M")?, 10 * 1024 * 1024);
//! assert_eq!(parse_size("512KB")?, 512 * 1024);
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    pub directory: PathBuf,

    /// Rotation threshold in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    #[serde(default)]
    pub sync_policy: SyncPolicy,

    #[serde(default = "default_read_batch_size")]
    pub read_batch_size: usize,

    #[serde(default = "default_read_interval", with = "duration_ms")]
    pub read_interval: Duration,
}

impl BufferConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_file_size == 0 {
            return Err(Error::InvalidConfig(
                "max_file_size must be greater than zero".to_string(),
            ));
        }
        if self.read_batch_size == 0 {
            return Err(Error::InvalidConfig(
                "read_batch_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./data/buffer"),
            max_file_size: default_max_file_size(),
            sync_policy: SyncPolicy::default(),
            read_batch_size: default_read_batch_size(),
            read_interval: default_read_interval(),
        }
    }
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024 // 10MB
}

fn default_read_batch_size() -> usize {
    500
}

fn default_read_interval() -> Duration {
    Duration::from_millis(100)
}

/// Whether an append waits for `fdatasync`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// Sync after every append (safest, slowest)
    #[default]
    Always,

    /// Leave flushing to the OS page cache (testing only)
    Never,
}

/// Parse `"10M"`, `"512KB"`, `"1g"` or a plain byte count.
pub fn parse_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);

    let number: u64 = digits
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("invalid size '{input}'")))?;

    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        other => {
            return Err(Error::InvalidConfig(format!(
                "unknown size unit '{other}' in '{input}'"
            )))
        }
    };

    number
        .checked_mul(multiplier)
        .ok_or_else(|| Error::InvalidConfig(format!("size '{input}' overflows")))
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
