//! Consumer lag on the outgoing stream.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::bus::{BusError, OffsetFetcher};

/// Partition → number of messages not yet consumed.
pub type PartitionLags = BTreeMap<u32, u64>;

/// Queries lag of one consumer group on one topic.
#[derive(Clone)]
pub struct LagMonitor {
    fetcher: Arc<dyn OffsetFetcher>,
    topic: String,
    group: String,
}

impl LagMonitor {
    pub fn new(fetcher: Arc<dyn OffsetFetcher>, topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            fetcher,
            topic: topic.into(),
            group: group.into(),
        }
    }

    pub async fn get(&self) -> Result<PartitionLags, BusError> {
        self.fetcher.consumer_lag(&self.topic, &self.group).await
    }
}

/// Partitions whose lag is strictly below `ceiling`, in ascending order.
pub fn eligible_partitions(lags: &PartitionLags, ceiling: u64) -> Vec<u32> {
    lags.iter()
        .filter(|(_, lag)| **lag < ceiling)
        .map(|(partition, _)| *partition)
        .collect()
}
