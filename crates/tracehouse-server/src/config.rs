//! Server configuration
//!
//! Every setting has a default and can be overridden through the
//! environment:
//!
//! | variable | default |
//! |---|---|
//! | `TRACEHOUSE_LISTEN_ADDR` | `0.0.0.0:11800` (ingest and remote dispatch) |
//! | `TRACEHOUSE_METRICS_ADDR` | `0.0.0.0:12800` |
//! | `TRACEHOUSE_BUFFER_PATH` | `./data/buffer` |
//! | `TRACEHOUSE_BUFFER_FILE_SIZE` | `10M` (`K/KB/M/MB/G/GB` suffixes) |
//! | `TRACEHOUSE_BUFFER_SYNC` | `always` or `never` |
//! | `TRACEHOUSE_PERSISTENCE_INTERVAL_MS` | `3000` |
//! | `TRACEHOUSE_FORCE_FLUSH_COUNT` | `100` |
//! | `TRACEHOUSE_CHANNEL_PARTITIONS` | `1` |
//! | `TRACEHOUSE_CHANNEL_SIZE` | `10000` |
//! | `TRACEHOUSE_CHANNEL_POLICY` | `blocking`, `if_possible` or `overwrite` |
//! | `TRACEHOUSE_SELF_ADDRESS` | `127.0.0.1:11800` |
//! | `TRACEHOUSE_SEEDS` | comma separated `host:port` list |
//! | `TRACEHOUSE_ROUTING` | `consistent_hash` or `round_robin` |
//! | `TRACEHOUSE_REMOTE_TIMEOUT_MS` | `3000` |

use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracehouse_cluster::{ClusterConfig, RemoteAddress};
use tracehouse_storage::{parse_size, BufferConfig};
use tracehouse_stream::{PersistenceConfig, WorkerConfig};

use crate::error::{Result, ServerError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Frame listener for agents and peers
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,
}

fn default_listen_addr() -> String {
    "0.0.0.0:11800".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:12800".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            metrics_addr: default_metrics_addr(),
            buffer: BufferConfig::default(),
            worker: WorkerConfig::default(),
            persistence: PersistenceConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from defaults, overridden by whatever `lookup` returns.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("TRACEHOUSE_LISTEN_ADDR") {
            config.listen_addr = v;
        }
        if let Some(v) = lookup("TRACEHOUSE_METRICS_ADDR") {
            config.metrics_addr = v;
        }

        if let Some(v) = lookup("TRACEHOUSE_BUFFER_PATH") {
            config.buffer.directory = v.into();
        }
        if let Some(v) = lookup("TRACEHOUSE_BUFFER_FILE_SIZE") {
            config.buffer.max_file_size =
                parse_size(&v).map_err(|e| invalid("TRACEHOUSE_BUFFER_FILE_SIZE", e))?;
        }
        if let Some(v) = lookup("TRACEHOUSE_BUFFER_SYNC") {
            config.buffer.sync_policy = parse_enum("TRACEHOUSE_BUFFER_SYNC", &v)?;
        }

        if let Some(v) = lookup("TRACEHOUSE_PERSISTENCE_INTERVAL_MS") {
            config.persistence.interval =
                Duration::from_millis(parse_num("TRACEHOUSE_PERSISTENCE_INTERVAL_MS", &v)?);
        }
        if let Some(v) = lookup("TRACEHOUSE_FORCE_FLUSH_COUNT") {
            config.worker.force_flush_count = parse_num("TRACEHOUSE_FORCE_FLUSH_COUNT", &v)?;
        }
        if let Some(v) = lookup("TRACEHOUSE_CHANNEL_PARTITIONS") {
            config.worker.channel.partitions = parse_num("TRACEHOUSE_CHANNEL_PARTITIONS", &v)?;
        }
        if let Some(v) = lookup("TRACEHOUSE_CHANNEL_SIZE") {
            config.worker.channel.buffer_size = parse_num("TRACEHOUSE_CHANNEL_SIZE", &v)?;
        }
        if let Some(v) = lookup("TRACEHOUSE_CHANNEL_POLICY") {
            config.worker.channel.strategy = parse_enum("TRACEHOUSE_CHANNEL_POLICY", &v)?;
        }

        if let Some(v) = lookup("TRACEHOUSE_SELF_ADDRESS") {
            config.cluster.self_address = parse_address("TRACEHOUSE_SELF_ADDRESS", &v)?;
        }
        if let Some(v) = lookup("TRACEHOUSE_SEEDS") {
            config.cluster.seeds = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse_address("TRACEHOUSE_SEEDS", s))
                .collect::<Result<Vec<_>>>()?;
        }
        if let Some(v) = lookup("TRACEHOUSE_ROUTING") {
            config.cluster.strategy = parse_enum("TRACEHOUSE_ROUTING", &v)?;
        }
        if let Some(v) = lookup("TRACEHOUSE_REMOTE_TIMEOUT_MS") {
            config.cluster.send_timeout =
                Duration::from_millis(parse_num("TRACEHOUSE_REMOTE_TIMEOUT_MS", &v)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.buffer.validate()?;
        if self.worker.force_flush_count == 0 {
            return Err(invalid("TRACEHOUSE_FORCE_FLUSH_COUNT", "must be greater than zero"));
        }
        self.worker.validate()?;
        self.cluster.validate()?;
        if self.persistence.interval.is_zero() {
            return Err(invalid(
                "TRACEHOUSE_PERSISTENCE_INTERVAL_MS",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

fn invalid(key: &str, reason: impl ToString) -> ServerError {
    ServerError::InvalidEnv {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_num<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e| invalid(key, e))
}

fn parse_address(key: &str, raw: &str) -> Result<RemoteAddress> {
    raw.parse().map_err(|e| invalid(key, e))
}

/// Parse a unit enum by its serde name, e.g. `if_possible`.
fn parse_enum<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_lowercase()))
        .map_err(|e| invalid(key, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tracehouse_cluster::RoutingStrategy;
    use tracehouse_storage::SyncPolicy;
    use tracehouse_stream::BufferStrategy;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<ServerConfig> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:11800");
        assert_eq!(config.buffer.max_file_size, 10 * 1024 * 1024);
        assert_eq!(config.persistence.interval, Duration::from_millis(3000));
        assert_eq!(config.worker.force_flush_count, 100);
        assert_eq!(config.worker.channel.strategy, BufferStrategy::Blocking);
        assert_eq!(config.cluster.strategy, RoutingStrategy::ConsistentHash);
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("TRACEHOUSE_BUFFER_PATH", "/var/lib/tracehouse"),
            ("TRACEHOUSE_BUFFER_FILE_SIZE", "512KB"),
            ("TRACEHOUSE_BUFFER_SYNC", "never"),
            ("TRACEHOUSE_PERSISTENCE_INTERVAL_MS", "500"),
            ("TRACEHOUSE_FORCE_FLUSH_COUNT", "10"),
            ("TRACEHOUSE_CHANNEL_PARTITIONS", "4"),
            ("TRACEHOUSE_CHANNEL_POLICY", "IF_POSSIBLE"),
            ("TRACEHOUSE_SELF_ADDRESS", "10.0.0.1:11800"),
            ("TRACEHOUSE_SEEDS", "10.0.0.2:11800, 10.0.0.3:11800,"),
            ("TRACEHOUSE_ROUTING", "round_robin"),
            ("TRACEHOUSE_REMOTE_TIMEOUT_MS", "750"),
        ])
        .unwrap();

        assert_eq!(config.buffer.directory.to_str(), Some("/var/lib/tracehouse"));
        assert_eq!(config.buffer.max_file_size, 512 * 1024);
        assert_eq!(config.buffer.sync_policy, SyncPolicy::Never);
        assert_eq!(config.persistence.interval, Duration::from_millis(500));
        assert_eq!(config.worker.force_flush_count, 10);
        assert_eq!(config.worker.channel.partitions, 4);
        assert_eq!(config.worker.channel.strategy, BufferStrategy::IfPossible);
        assert_eq!(config.cluster.seeds.len(), 2);
        assert_eq!(config.cluster.members().len(), 3);
        assert_eq!(config.cluster.strategy, RoutingStrategy::RoundRobin);
        assert_eq!(config.cluster.send_timeout, Duration::from_millis(750));
    }

    #[test]
    fn test_invalid_values_name_the_variable() {
        for (key, value) in [
            ("TRACEHOUSE_BUFFER_FILE_SIZE", "ten"),
            ("TRACEHOUSE_CHANNEL_POLICY", "sometimes"),
            ("TRACEHOUSE_SEEDS", "10.0.0.2"),
            ("TRACEHOUSE_FORCE_FLUSH_COUNT", "-1"),
        ] {
            match from_pairs(&[(key, value)]) {
                Err(ServerError::InvalidEnv { key: k, .. }) => assert_eq!(k, key),
                other => panic!("{key}={value}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_zero_values_fail_validation() {
        assert!(from_pairs(&[("TRACEHOUSE_CHANNEL_SIZE", "0")]).is_err());
        assert!(from_pairs(&[("TRACEHOUSE_PERSISTENCE_INTERVAL_MS", "0")]).is_err());
        assert!(from_pairs(&[("TRACEHOUSE_FORCE_FLUSH_COUNT", "0")]).is_err());
    }
}
