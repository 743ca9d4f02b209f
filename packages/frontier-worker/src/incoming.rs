//! Incoming stream consumption: crawl results and new seeds.
//!
//! ```text
//! incoming stream ──► fetch (≤ batch_size, ≤ poll_timeout)
//!                       │
//!                       ├─► decode ──✗──► log, skip
//!                       │
//!                       ├─► add_seeds ─────────────────────► backend.add_seeds
//!                       ├─► page_crawled  ─► jid == current? ► backend.page_crawled
//!                       └─► request_error ─► jid == current? ► backend.request_error
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::backend::FrontierBackend;
use crate::bus::{BusMessage, StreamConsumer};
use crate::codec::Codec;
use crate::messages::FrontierMessage;
use crate::types::JobId;

/// Default number of messages pulled per cycle.
pub const DEFAULT_CONSUMER_BATCH_SIZE: usize = 128;

/// Default total time a cycle waits for messages.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct IncomingConfig {
    pub batch_size: usize,
    pub poll_timeout: Duration,
}

impl Default for IncomingConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_CONSUMER_BATCH_SIZE,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

/// What one incoming cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingReport {
    /// Messages pulled from the stream, malformed ones included.
    pub consumed: usize,
    pub dispatched: usize,
    pub malformed: usize,
    /// Results from an older job generation.
    pub stale: usize,
    /// Decodable messages of a kind this stream does not carry.
    pub ignored: usize,
    /// The read position was invalidated and moved to the tail.
    pub offset_reset: bool,
}

pub struct IncomingPipeline {
    consumer: Box<dyn StreamConsumer>,
    codec: Arc<dyn Codec>,
    config: IncomingConfig,
}

impl IncomingPipeline {
    pub fn new(consumer: Box<dyn StreamConsumer>, codec: Arc<dyn Codec>, config: IncomingConfig) -> Self {
        Self {
            consumer,
            codec,
            config,
        }
    }

    /// Run one consumption cycle against `backend`.
    ///
    /// Messages are dispatched in the order they were pulled. Backend and
    /// bus failures abort the cycle; malformed and stale messages do not.
    pub async fn consume(&mut self, backend: &dyn FrontierBackend, job_id: JobId) -> Result<IncomingReport> {
        let deadline = Instant::now() + self.config.poll_timeout;
        let mut report = IncomingReport::default();

        while report.consumed < self.config.batch_size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let message = match self.consumer.fetch(remaining).await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) if e.is_offset_out_of_range() => {
                    self.consumer
                        .seek_to_tail()
                        .await
                        .context("failed to seek incoming stream to tail")?;
                    info!(
                        topic = self.consumer.topic(),
                        error = %e,
                        "caught offset out of range, moving to the tail of the log"
                    );
                    report.offset_reset = true;
                    break;
                }
                Err(e) => {
                    return Err(e).context("failed to fetch from incoming stream");
                }
            };

            report.consumed += 1;
            self.dispatch(message, backend, job_id, &mut report).await?;
        }

        info!(
            consumed = report.consumed,
            dispatched = report.dispatched,
            stale = report.stale,
            malformed = report.malformed,
            "consumed incoming items"
        );
        Ok(report)
    }

    async fn dispatch(
        &mut self,
        message: BusMessage,
        backend: &dyn FrontierBackend,
        job_id: JobId,
        report: &mut IncomingReport,
    ) -> Result<()> {
        let decoded = match self.codec.decode(&message.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!(
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "decoding error"
                );
                report.malformed += 1;
                return Ok(());
            }
        };

        match decoded {
            FrontierMessage::AddSeeds { seeds } => {
                info!(count = seeds.len(), "adding seeds");
                for seed in &seeds {
                    debug!(url = %seed.url, "seed");
                }
                backend.add_seeds(seeds).await.context("backend add_seeds failed")?;
                report.dispatched += 1;
            }
            FrontierMessage::PageCrawled { response, links } => {
                debug!(url = %response.url, "page crawled");
                if response.job_id() != Some(job_id) {
                    debug!(url = %response.url, jid = ?response.job_id(), current = %job_id, "dropping stale page");
                    report.stale += 1;
                    return Ok(());
                }
                backend
                    .page_crawled(response, links)
                    .await
                    .context("backend page_crawled failed")?;
                report.dispatched += 1;
            }
            FrontierMessage::RequestError { request, error } => {
                if request.job_id() != Some(job_id) {
                    debug!(url = %request.url, jid = ?request.job_id(), current = %job_id, "dropping stale request error");
                    report.stale += 1;
                    return Ok(());
                }
                info!(url = %request.url, error = %error, "request error");
                backend
                    .request_error(request, error)
                    .await
                    .context("backend request_error failed")?;
                report.dispatched += 1;
            }
            other => {
                debug!(kind = other.kind(), "ignoring message not carried by incoming stream");
                report.ignored += 1;
            }
        }
        Ok(())
    }
}
