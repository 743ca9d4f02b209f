//! In-process bus with partitioned, offset-addressed logs.
//!
//! Each partition keeps at most `retention` messages (unbounded by default).
//! When older messages are evicted the earliest retained offset moves
//! forward, and a consumer still positioned before it gets
//! [`BusError::OffsetOutOfRange`], the same way a broker behaves after log
//! retention kicks in.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::bus::{BusError, BusMessage, OffsetFetcher, StreamConsumer, StreamProducer};
use crate::lag::PartitionLags;

#[derive(Debug, Default)]
struct PartitionLog {
    /// Offset of `entries[0]`.
    base: u64,
    entries: VecDeque<(Bytes, Bytes)>,
}

impl PartitionLog {
    fn end(&self) -> u64 {
        self.base + self.entries.len() as u64
    }
}

#[derive(Debug, Default)]
struct BusState {
    topics: HashMap<String, Vec<PartitionLog>>,
    /// (group, topic, partition) → next offset to read.
    committed: HashMap<(String, String, u32), u64>,
    retention: Option<usize>,
    disconnected: bool,
}

impl BusState {
    fn check_connected(&self) -> Result<(), BusError> {
        if self.disconnected {
            return Err(BusError::Disconnected("memory bus closed".to_string()));
        }
        Ok(())
    }

    fn topic(&self, topic: &str) -> Result<&Vec<PartitionLog>, BusError> {
        self.check_connected()?;
        self.topics
            .get(topic)
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))
    }

    fn committed(&self, group: &str, topic: &str, partition: u32) -> Option<u64> {
        self.committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    fn commit(&mut self, group: &str, topic: &str, partition: u32, offset: u64) {
        self.committed
            .insert((group.to_string(), topic.to_string(), partition), offset);
    }
}

struct BusInner {
    state: Mutex<BusState>,
    appended: Notify,
}

/// Shared handle to an in-process bus. Clones share the same logs.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                state: Mutex::new(BusState::default()),
                appended: Notify::new(),
            }),
        }
    }

    /// Keep at most `max_messages` per partition.
    pub fn with_retention(self, max_messages: usize) -> Self {
        self.lock().retention = Some(max_messages);
        self
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create `topic` with `partitions` partitions. Existing topics are left alone.
    pub fn create_topic(&self, topic: &str, partitions: u32) {
        let mut state = self.lock();
        state.topics.entry(topic.to_string()).or_insert_with(|| {
            (0..partitions.max(1)).map(|_| PartitionLog::default()).collect()
        });
    }

    /// Append a message and return its offset.
    pub fn append(&self, topic: &str, partition: u32, key: Bytes, payload: Bytes) -> Result<u64, BusError> {
        let offset = {
            let mut state = self.lock();
            state.check_connected()?;
            let retention = state.retention;
            let log = state
                .topics
                .get_mut(topic)
                .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?
                .get_mut(partition as usize)
                .ok_or_else(|| BusError::UnknownTopic(format!("{topic}/{partition}")))?;

            let offset = log.end();
            log.entries.push_back((key, payload));
            if let Some(max) = retention {
                while log.entries.len() > max {
                    log.entries.pop_front();
                    log.base += 1;
                }
            }
            offset
        };
        self.inner.appended.notify_waiters();
        Ok(offset)
    }

    /// Record that `group` has consumed `topic/partition` up to `offset`.
    pub fn commit(&self, group: &str, topic: &str, partition: u32, offset: u64) {
        self.lock().commit(group, topic, partition, offset);
    }

    /// Messages currently retained in one partition.
    pub fn messages(&self, topic: &str, partition: u32) -> Vec<BusMessage> {
        let state = self.lock();
        let Some(log) = state
            .topics
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
        else {
            return Vec::new();
        };
        log.entries
            .iter()
            .enumerate()
            .map(|(i, (key, payload))| BusMessage {
                partition,
                offset: log.base + i as u64,
                key: Some(key.clone()),
                payload: payload.clone(),
            })
            .collect()
    }

    /// Simulate losing the broker: every later operation fails with
    /// [`BusError::Disconnected`].
    pub fn disconnect(&self) {
        self.lock().disconnected = true;
        self.inner.appended.notify_waiters();
    }

    /// A consumer reading `topic` for `group`, starting at the group's
    /// committed offsets (or offset 0).
    pub fn consumer(&self, group: &str, topic: &str) -> MemoryConsumer {
        MemoryConsumer {
            bus: self.clone(),
            group: group.to_string(),
            topic: topic.to_string(),
            positions: Vec::new(),
            next_partition: 0,
        }
    }
}

#[async_trait]
impl StreamProducer for MemoryBus {
    async fn send(&self, topic: &str, partition: u32, key: Bytes, payload: Bytes) -> Result<(), BusError> {
        self.append(topic, partition, key, payload).map(|_| ())
    }

    async fn partition_count(&self, topic: &str) -> Result<u32, BusError> {
        Ok(self.lock().topic(topic)?.len() as u32)
    }
}

#[async_trait]
impl OffsetFetcher for MemoryBus {
    async fn consumer_lag(&self, topic: &str, group: &str) -> Result<PartitionLags, BusError> {
        let state = self.lock();
        let partitions = state.topic(topic)?;
        Ok(partitions
            .iter()
            .enumerate()
            .map(|(i, log)| {
                let partition = i as u32;
                let committed = state.committed(group, topic, partition).unwrap_or(0);
                (partition, log.end().saturating_sub(committed))
            })
            .collect())
    }
}

/// Consumer side of [`MemoryBus`]. Commits its position after every fetch.
pub struct MemoryConsumer {
    bus: MemoryBus,
    group: String,
    topic: String,
    positions: Vec<u64>,
    next_partition: usize,
}

impl MemoryConsumer {
    fn try_fetch(&mut self) -> Result<Option<BusMessage>, BusError> {
        let mut state = self.bus.lock();
        let partition_count = state.topic(&self.topic)?.len();

        if self.positions.len() != partition_count {
            self.positions = (0..partition_count as u32)
                .map(|p| state.committed(&self.group, &self.topic, p).unwrap_or(0))
                .collect();
        }

        for step in 0..partition_count {
            let index = (self.next_partition + step) % partition_count;
            let partition = index as u32;
            let position = self.positions[index];
            let log = &state.topic(&self.topic)?[index];

            if position < log.base {
                return Err(BusError::OffsetOutOfRange {
                    topic: self.topic.clone(),
                    partition,
                    offset: position,
                    earliest: log.base,
                });
            }
            if position >= log.end() {
                continue;
            }

            let (key, payload) = log.entries[(position - log.base) as usize].clone();
            let message = BusMessage {
                partition,
                offset: position,
                key: Some(key),
                payload,
            };

            self.positions[index] = position + 1;
            self.next_partition = index + 1;
            state.commit(&self.group, &self.topic, partition, position + 1);
            return Ok(Some(message));
        }
        Ok(None)
    }
}

#[async_trait]
impl StreamConsumer for MemoryConsumer {
    async fn fetch(&mut self, timeout: Duration) -> Result<Option<BusMessage>, BusError> {
        let deadline = Instant::now() + timeout;
        let inner = Arc::clone(&self.bus.inner);
        loop {
            // Register interest before looking, so an append between the
            // check and the wait is not missed.
            let appended = inner.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if let Some(message) = self.try_fetch()? {
                return Ok(Some(message));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn seek_to_tail(&mut self) -> Result<(), BusError> {
        let mut state = self.bus.lock();
        let ends: Vec<u64> = state.topic(&self.topic)?.iter().map(PartitionLog::end).collect();
        for (partition, end) in ends.iter().enumerate() {
            state.commit(&self.group, &self.topic, partition as u32, *end);
        }
        self.positions = ends;
        Ok(())
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}
