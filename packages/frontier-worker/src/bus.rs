//! Message bus abstraction.
//!
//! Provides trait seams for the three things the worker needs from a bus:
//! pulling from a stream, publishing to a partition, and reading consumer
//! lag. Connection management and the broker protocol live behind these
//! traits. [`crate::memory::MemoryBus`] implements all three.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::lag::PartitionLags;

/// A message pulled from a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub partition: u32,
    pub offset: u64,
    pub key: Option<Bytes>,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    /// The requested read position is no longer retained by the bus.
    #[error("offset {offset} out of range for {topic}/{partition} (earliest retained: {earliest})")]
    OffsetOutOfRange {
        topic: String,
        partition: u32,
        offset: u64,
        earliest: u64,
    },

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    /// Connectivity to the bus is lost. Fatal to the worker.
    #[error("bus disconnected: {0}")]
    Disconnected(String),
}

impl BusError {
    pub fn is_offset_out_of_range(&self) -> bool {
        matches!(self, BusError::OffsetOutOfRange { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, BusError::Disconnected(_))
    }
}

/// Pulls messages from one stream on behalf of a consumer group.
#[async_trait]
pub trait StreamConsumer: Send {
    /// Fetch the next message, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when nothing arrived in time. A zero timeout never
    /// waits.
    async fn fetch(&mut self, timeout: Duration) -> Result<Option<BusMessage>, BusError>;

    /// Move every partition's read position to the current end of the log.
    async fn seek_to_tail(&mut self) -> Result<(), BusError>;

    fn topic(&self) -> &str;
}

/// Publishes messages to explicit partitions.
#[async_trait]
pub trait StreamProducer: Send + Sync {
    async fn send(
        &self,
        topic: &str,
        partition: u32,
        key: Bytes,
        payload: Bytes,
    ) -> Result<(), BusError>;

    /// Number of partitions of `topic`.
    async fn partition_count(&self, topic: &str) -> Result<u32, BusError>;
}

/// Reads how far a consumer group is behind on a topic.
#[async_trait]
pub trait OffsetFetcher: Send + Sync {
    async fn consumer_lag(&self, topic: &str, group: &str) -> Result<PartitionLags, BusError>;
}

/// Returns the first fatal [`BusError`] in an error chain, if any.
pub fn find_fatal(error: &anyhow::Error) -> Option<&BusError> {
    error
        .chain()
        .filter_map(|cause| cause.downcast_ref::<BusError>())
        .find(|bus| bus.is_fatal())
}
