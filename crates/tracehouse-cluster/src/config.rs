//! Cluster configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};
use crate::membership::RemoteAddress;
use crate::router::RoutingStrategy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Address peers use to reach this member
    #[serde(default = "default_self_address")]
    pub self_address: RemoteAddress,

    /// Other members known at startup
    #[serde(default)]
    pub seeds: Vec<RemoteAddress>,

    #[serde(default)]
    pub strategy: RoutingStrategy,

    /// Ring points per endpoint
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,

    /// Bound on connect, send and ack wait of one remote send
    #[serde(default = "default_send_timeout", with = "duration_ms")]
    pub send_timeout: Duration,
}

fn default_self_address() -> RemoteAddress {
    RemoteAddress::new("127.0.0.1", 11800)
}

fn default_virtual_nodes() -> usize {
    100
}

fn default_send_timeout() -> Duration {
    Duration::from_millis(3000)
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            self_address: default_self_address(),
            seeds: Vec::new(),
            strategy: RoutingStrategy::default(),
            virtual_nodes: default_virtual_nodes(),
            send_timeout: default_send_timeout(),
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.virtual_nodes == 0 {
            return Err(ClusterError::InvalidConfig(
                "virtual_nodes must be greater than zero".to_string(),
            ));
        }
        if self.send_timeout.is_zero() {
            return Err(ClusterError::InvalidConfig(
                "send_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// This member followed by the seeds, without duplicates.
    pub fn members(&self) -> Vec<RemoteAddress> {
        let mut members = vec![self.self_address.clone()];
        for seed in &self.seeds {
            if !members.contains(seed) {
                members.push(seed.clone());
            }
        }
        members
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
