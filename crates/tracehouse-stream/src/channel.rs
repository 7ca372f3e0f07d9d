//! Buffered Channels
//!
//! The dispatch queue in front of every local worker: `N` bounded FIFO
//! partitions, many producers, one consumer.
//!
//! ```text
//! producers ──save(key, item)──► selector ──► [p0: ▢▢▢▢▢▢]
//!                                             [p1: ▢▢▢    ] ──drain──► consumer task
//!                                             [p2: ▢▢▢▢▢  ]
//! ```
//!
//! ## Admission when a partition is full
//!
//! - `Blocking`: wait until the consumer drains
//! - `IfPossible`: reject the new item
//! - `Overwrite`: evict the oldest item of that partition
//!
//! Whatever stays in a partition stays in FIFO order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracehouse_observability::metrics::CHANNEL_DROPPED_TOTAL;

use crate::error::{Result, StreamError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferStrategy {
    #[default]
    Blocking,
    IfPossible,
    Overwrite,
}

impl BufferStrategy {
    fn label(self) -> &'static str {
        match self {
            BufferStrategy::Blocking => "blocking",
            BufferStrategy::IfPossible => "if_possible",
            BufferStrategy::Overwrite => "overwrite",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionSelector {
    /// `key % partitions`, keeps one key on one partition
    #[default]
    Hash,
    RoundRobin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_partitions")]
    pub partitions: usize,

    /// Capacity of each partition
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default)]
    pub strategy: BufferStrategy,

    #[serde(default)]
    pub selector: PartitionSelector,
}

fn default_partitions() -> usize {
    1
}

fn default_buffer_size() -> usize {
    10_000
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            buffer_size: default_buffer_size(),
            strategy: BufferStrategy::default(),
            selector: PartitionSelector::default(),
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 || self.buffer_size == 0 {
            return Err(StreamError::InvalidConfig(
                "channel partitions and buffer_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// What happened to an item handed to [`Channels::save`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Rejected because the partition was full
    Dropped,
    /// Accepted after evicting the oldest item
    Overwrote,
}

pub struct Channels<T> {
    name: String,
    partitions: Vec<Mutex<VecDeque<T>>>,
    capacity: usize,
    strategy: BufferStrategy,
    selector: PartitionSelector,
    round_robin: AtomicUsize,
    closed: AtomicBool,
    /// Producers waiting for space
    space: Notify,
    /// Consumer waiting for items
    data: Notify,
}

impl<T> Channels<T> {
    pub fn new(name: impl Into<String>, config: &ChannelConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            partitions: (0..config.partitions)
                .map(|_| Mutex::new(VecDeque::with_capacity(config.buffer_size)))
                .collect(),
            capacity: config.buffer_size,
            strategy: config.strategy,
            selector: config.selector,
            round_robin: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            space: Notify::new(),
            data: Notify::new(),
        })
    }

    fn partition(&self, index: usize) -> MutexGuard<'_, VecDeque<T>> {
        self.partitions[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn select(&self, key: u64) -> usize {
        let n = self.partitions.len();
        match self.selector {
            PartitionSelector::Hash => (key % n as u64) as usize,
            PartitionSelector::RoundRobin => self.round_robin.fetch_add(1, Ordering::Relaxed) % n,
        }
    }

    /// Enqueue `item` on the partition chosen for `key`.
    pub async fn save(&self, key: u64, item: T) -> Result<Admission> {
        let index = self.select(key);

        loop {
            // registered before the capacity check so a drain in between is not missed
            let space = self.space.notified();

            {
                if self.closed.load(Ordering::Acquire) {
                    return Err(StreamError::WorkerClosed(self.name.clone()));
                }

                let mut partition = self.partition(index);
                if partition.len() < self.capacity {
                    partition.push_back(item);
                    drop(partition);
                    self.data.notify_one();
                    return Ok(Admission::Accepted);
                }

                match self.strategy {
                    BufferStrategy::Blocking => {}
                    BufferStrategy::IfPossible => {
                        drop(partition);
                        self.count_drop();
                        return Ok(Admission::Dropped);
                    }
                    BufferStrategy::Overwrite => {
                        partition.pop_front();
                        partition.push_back(item);
                        drop(partition);
                        self.count_drop();
                        self.data.notify_one();
                        return Ok(Admission::Overwrote);
                    }
                }
            }

            space.await;
        }
    }

    fn count_drop(&self) {
        CHANNEL_DROPPED_TOTAL
            .with_label_values(&[self.name.as_str(), self.strategy.label()])
            .inc();
    }

    /// Move every queued item into `out`, partition by partition.
    pub fn drain_into(&self, out: &mut Vec<T>) -> usize {
        let before = out.len();
        for index in 0..self.partitions.len() {
            out.extend(self.partition(index).drain(..));
        }
        let moved = out.len() - before;
        if moved > 0 {
            self.space.notify_waiters();
        }
        moved
    }

    /// Resolves once an item may be available.
    pub async fn wait_for_data(&self) {
        self.data.notified().await;
    }

    pub fn len(&self) -> usize {
        (0..self.partitions.len())
            .map(|index| self.partition(index).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject further saves and wake everyone waiting.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.space.notify_waiters();
        self.data.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn config(size: usize, strategy: BufferStrategy) -> ChannelConfig {
        ChannelConfig {
            partitions: 1,
            buffer_size: size,
            strategy,
            selector: PartitionSelector::Hash,
        }
    }

    fn drained(channels: &Channels<u32>) -> Vec<u32> {
        let mut out = Vec::new();
        channels.drain_into(&mut out);
        out
    }

    #[tokio::test]
    async fn test_if_possible_rejects_new_item() {
        let channels = Channels::new("t-if-possible", &config(2, BufferStrategy::IfPossible)).unwrap();
        assert_eq!(channels.save(0, 1).await.unwrap(), Admission::Accepted);
        assert_eq!(channels.save(0, 2).await.unwrap(), Admission::Accepted);
        assert_eq!(channels.save(0, 3).await.unwrap(), Admission::Dropped);
        assert_eq!(drained(&channels), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_overwrite_evicts_oldest() {
        let channels = Channels::new("t-overwrite", &config(2, BufferStrategy::Overwrite)).unwrap();
        for i in 1..=4 {
            channels.save(0, i).await.unwrap();
        }
        assert_eq!(drained(&channels), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_blocking_waits_for_drain() {
        let channels =
            Arc::new(Channels::new("t-blocking", &config(1, BufferStrategy::Blocking)).unwrap());
        channels.save(0, 1).await.unwrap();

        let producer = {
            let channels = Arc::clone(&channels);
            tokio::spawn(async move { channels.save(0, 2).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        assert_eq!(drained(&channels), vec![1]);
        let admission = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(admission, Admission::Accepted);
        assert_eq!(drained(&channels), vec![2]);
    }

    #[tokio::test]
    async fn test_close_releases_blocked_producer() {
        let channels =
            Arc::new(Channels::new("t-close", &config(1, BufferStrategy::Blocking)).unwrap());
        channels.save(0, 1).await.unwrap();

        let producer = {
            let channels = Arc::clone(&channels);
            tokio::spawn(async move { channels.save(0, 2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        channels.close();

        let result = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(StreamError::WorkerClosed(_))));
    }

    #[tokio::test]
    async fn test_selectors() {
        let hash: Channels<u32> = Channels::new(
            "t-hash",
            &ChannelConfig {
                partitions: 4,
                ..config(10, BufferStrategy::Blocking)
            },
        )
        .unwrap();
        assert_eq!(hash.select(6), 2);
        assert_eq!(hash.select(6), 2);

        let rr: Channels<u32> = Channels::new(
            "t-rr",
            &ChannelConfig {
                partitions: 3,
                selector: PartitionSelector::RoundRobin,
                ..config(10, BufferStrategy::Blocking)
            },
        )
        .unwrap();
        let picks: Vec<usize> = (0..6).map(|_| rr.select(0)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[tokio::test]
    async fn test_fifo_per_partition() {
        let channels = Channels::new(
            "t-fifo",
            &ChannelConfig {
                partitions: 2,
                ..config(100, BufferStrategy::Blocking)
            },
        )
        .unwrap();
        for i in 0..10u32 {
            channels.save(u64::from(i % 2), i).await.unwrap();
        }
        assert_eq!(drained(&channels), vec![0, 2, 4, 6, 8, 1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(Channels::<u32>::new("t-zero", &config(0, BufferStrategy::Blocking)).is_err());
    }
}
