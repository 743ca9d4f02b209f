//! Batch generation with lag-based backpressure.
//!
//! ```text
//! LagMonitor.get() ──► {p : lag[p] < max_next_requests}
//!                          │ (empty → no-op)
//!                          ▼
//! backend.get_next_requests(max_next_requests, eligible)
//!                          │
//!                          ▼ for each request
//!              tag jid ─► encode ─► key = host ─► crc32 partition ─► publish
//! ```
//!
//! A partition only receives new work while its downstream queue is below
//! the ceiling, so slow crawlers are not buried.

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use tracing::{error, info, warn};
use url::Url;

use crate::backend::FrontierBackend;
use crate::bus::StreamProducer;
use crate::codec::Codec;
use crate::lag::{eligible_partitions, LagMonitor};
use crate::partitioner::{Crc32NamePartitioner, Partitioner};
use crate::types::{JobId, Request};

/// Key used to place a URL on a partition.
///
/// The host name when the URL has one; otherwise the raw URL, so that
/// unparseable URLs still land on a stable partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionKey {
    Host(String),
    RawUrl(String),
}

impl PartitionKey {
    pub fn for_url(url: &str) -> Self {
        match Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_owned)) {
            Some(host) => PartitionKey::Host(host),
            None => PartitionKey::RawUrl(url.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PartitionKey::Host(key) | PartitionKey::RawUrl(key) => key,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.as_str().as_bytes()
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, PartitionKey::RawUrl(_))
    }
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub outgoing_topic: String,
    /// Lag ceiling per partition and the size of each backend request.
    pub max_next_requests: usize,
}

/// What one batch cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub eligible: Vec<u32>,
    /// Requests returned by the backend, encode failures included.
    pub attempted: usize,
    pub published: usize,
    pub encode_failures: usize,
}

impl BatchReport {
    /// True when no partition had room, so the backend was not queried.
    pub fn is_noop(&self) -> bool {
        self.eligible.is_empty()
    }
}

pub struct BatchGenerator {
    lag: LagMonitor,
    producer: Arc<dyn StreamProducer>,
    codec: Arc<dyn Codec>,
    partitioner: Crc32NamePartitioner,
    config: BatchConfig,
}

impl BatchGenerator {
    pub fn new(
        lag: LagMonitor,
        producer: Arc<dyn StreamProducer>,
        codec: Arc<dyn Codec>,
        config: BatchConfig,
    ) -> Self {
        Self {
            lag,
            producer,
            codec,
            partitioner: Crc32NamePartitioner::new(),
            config,
        }
    }

    pub async fn generate(&self, backend: &dyn FrontierBackend, job_id: JobId) -> Result<BatchReport> {
        let lags = self.lag.get().await.context("failed to fetch outgoing lag")?;
        info!(lags = ?lags, "got lags");

        let eligible = eligible_partitions(&lags, self.config.max_next_requests as u64);
        info!(partitions = ?eligible, "getting new batches for partitions");
        if eligible.is_empty() {
            return Ok(BatchReport::default());
        }

        let partition_count = self
            .producer
            .partition_count(&self.config.outgoing_topic)
            .await
            .context("failed to read outgoing partition count")?;

        let requests = backend
            .get_next_requests(self.config.max_next_requests, &eligible)
            .await
            .context("backend get_next_requests failed")?;

        let mut report = BatchReport {
            eligible,
            ..Default::default()
        };

        for mut request in requests {
            report.attempted += 1;

            request.set_job_id(job_id);
            let encoded = match self.codec.encode_request(&request) {
                Ok(encoded) => encoded,
                Err(e) => {
                    error!(
                        error = %e,
                        fingerprint = request.fingerprint_or_unknown(),
                        url = %request.url,
                        "encoding error"
                    );
                    report.encode_failures += 1;
                    continue;
                }
            };

            self.publish(&request, encoded, partition_count).await?;
            report.published += 1;
        }

        info!(count = report.attempted, published = report.published, "pushed new batch");
        Ok(report)
    }

    async fn publish(&self, request: &Request, encoded: Bytes, partition_count: u32) -> Result<()> {
        let key = PartitionKey::for_url(&request.url);
        if key.is_fallback() {
            warn!(
                fingerprint = request.fingerprint_or_unknown(),
                url = %request.url,
                "URL parsing error, partitioning by raw URL"
            );
        }

        let partition = self
            .partitioner
            .partition(key.as_bytes(), partition_count)
            .context("failed to pick outgoing partition")?;

        self.producer
            .send(
                &self.config.outgoing_topic,
                partition,
                Bytes::copy_from_slice(key.as_bytes()),
                encoded,
            )
            .await
            .with_context(|| format!("failed to publish {}", request.url))
    }
}
