//! Scoring stream consumption.
//!
//! Collects `update_score` messages into a [`ScoreBatch`] (last write per
//! fingerprint wins) and applies it to the backend in one call at the end of
//! the cycle. `new_job_id` messages switch the worker's generation
//! immediately, in stream order.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::backend::FrontierBackend;
use crate::bus::{BusError, StreamConsumer};
use crate::codec::Codec;
use crate::messages::FrontierMessage;
use crate::types::{JobId, ScoreBatch};

pub const DEFAULT_SCORING_BATCH_SIZE: usize = 1024;

pub const DEFAULT_SCORING_POLL_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ScoringConfig {
    pub batch_size: usize,
    pub poll_timeout: Duration,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_SCORING_BATCH_SIZE,
            poll_timeout: DEFAULT_SCORING_POLL_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScoringReport {
    pub consumed: usize,
    pub malformed: usize,
    /// Distinct fingerprints sent to the backend.
    pub applied: usize,
    /// Set when a `new_job_id` message moved the generation.
    pub new_job_id: Option<JobId>,
    pub offset_reset: bool,
}

pub struct ScoringPipeline {
    consumer: Box<dyn StreamConsumer>,
    codec: Arc<dyn Codec>,
    config: ScoringConfig,
}

impl ScoringPipeline {
    pub fn new(consumer: Box<dyn StreamConsumer>, codec: Arc<dyn Codec>, config: ScoringConfig) -> Self {
        Self {
            consumer,
            codec,
            config,
        }
    }

    /// Run one scoring cycle. `job_id` is updated in place.
    ///
    /// Whatever was collected before the pull stopped, including a stop
    /// caused by an invalidated offset, is applied before returning.
    pub async fn consume(&mut self, backend: &dyn FrontierBackend, job_id: &mut JobId) -> Result<ScoringReport> {
        let mut report = ScoringReport::default();
        let mut batch = ScoreBatch::new();

        let pull_error = self.pull(&mut batch, job_id, &mut report).await;

        report.applied = batch.len();
        if !batch.is_empty() {
            backend
                .update_score(batch)
                .await
                .context("backend update_score failed")?;
        }

        match pull_error {
            None => {}
            Some(e) if e.is_offset_out_of_range() => {
                self.consumer
                    .seek_to_tail()
                    .await
                    .context("failed to seek scoring stream to tail")?;
                info!(
                    topic = self.consumer.topic(),
                    error = %e,
                    "caught offset out of range, moving to the tail of the log"
                );
                report.offset_reset = true;
            }
            Some(e) => return Err(e).context("failed to fetch from scoring stream"),
        }

        info!(
            consumed = report.consumed,
            applied = report.applied,
            "consumed items during scoring consumption"
        );
        Ok(report)
    }

    /// Pull until the batch size or the poll timeout is reached.
    /// Returns the bus error that stopped the pull, if any.
    async fn pull(&mut self, batch: &mut ScoreBatch, job_id: &mut JobId, report: &mut ScoringReport) -> Option<BusError> {
        let deadline = Instant::now() + self.config.poll_timeout;

        while report.consumed < self.config.batch_size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let message = match self.consumer.fetch(remaining).await {
                Ok(Some(message)) => message,
                Ok(None) => return None,
                Err(e) => return Some(e),
            };
            report.consumed += 1;

            match self.codec.decode(&message.payload) {
                Ok(FrontierMessage::UpdateScore(update)) => batch.upsert(update),
                Ok(FrontierMessage::NewJobId { job_id: new_id }) => {
                    info!(previous = %job_id, current = %new_id, "switching job id");
                    *job_id = new_id;
                    report.new_job_id = Some(new_id);
                }
                Ok(other) => {
                    debug!(kind = other.kind(), "ignoring message not carried by scoring stream");
                }
                Err(e) => {
                    error!(
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "decoding error"
                    );
                    report.malformed += 1;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::memory::MemoryBus;
    use crate::testing::{BackendCall, RecordingBackend};
    use crate::types::ScoreUpdate;
    use bytes::Bytes;

    const TOPIC: &str = "scoring";

    fn pipeline(bus: &MemoryBus) -> ScoringPipeline {
        ScoringPipeline::new(
            Box::new(bus.consumer("frontier", TOPIC)),
            Arc::new(JsonCodec::new()),
            ScoringConfig {
                batch_size: 1024,
                poll_timeout: Duration::ZERO,
            },
        )
    }

    fn publish(bus: &MemoryBus, message: FrontierMessage) {
        let payload = JsonCodec::new().encode(&message).unwrap();
        bus.append(TOPIC, 0, Bytes::new(), payload).unwrap();
    }

    fn score(fingerprint: &str, score: f64) -> FrontierMessage {
        FrontierMessage::UpdateScore(ScoreUpdate {
            fingerprint: fingerprint.into(),
            score,
            url: format!("https://{fingerprint}.test/"),
            schedule: false,
        })
    }

    fn applied_batches(backend: &RecordingBackend) -> Vec<ScoreBatch> {
        backend
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::UpdateScore(batch) => Some(batch),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_last_update_per_fingerprint_wins() {
        let bus = MemoryBus::new();
        bus.create_topic(TOPIC, 1);
        publish(&bus, score("aa", 0.1));
        publish(&bus, score("bb", 0.2));
        publish(&bus, score("aa", 0.7));
        publish(&bus, score("aa", 0.3));

        let backend = RecordingBackend::new();
        let mut job_id = JobId(0);
        let report = pipeline(&bus).consume(&backend, &mut job_id).await.unwrap();

        assert_eq!(report.consumed, 4);
        assert_eq!(report.applied, 2);

        let batches = applied_batches(&backend);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].get("aa").unwrap().score, 0.3);
        assert_eq!(batches[0].get("bb").unwrap().score, 0.2);
    }

    #[tokio::test]
    async fn test_new_job_id_updates_generation() {
        let bus = MemoryBus::new();
        bus.create_topic(TOPIC, 1);
        publish(&bus, score("aa", 1.0));
        publish(&bus, FrontierMessage::NewJobId { job_id: JobId(3) });

        let backend = RecordingBackend::new();
        let mut job_id = JobId(0);
        let report = pipeline(&bus).consume(&backend, &mut job_id).await.unwrap();

        assert_eq!(job_id, JobId(3));
        assert_eq!(report.new_job_id, Some(JobId(3)));
        assert_eq!(applied_batches(&backend).len(), 1);
    }

    #[tokio::test]
    async fn test_empty_cycle_does_not_call_backend() {
        let bus = MemoryBus::new();
        bus.create_topic(TOPIC, 1);

        let backend = RecordingBackend::new();
        let mut job_id = JobId(0);
        let report = pipeline(&bus).consume(&backend, &mut job_id).await.unwrap();

        assert_eq!(report, ScoringReport::default());
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_skipped() {
        let bus = MemoryBus::new();
        bus.create_topic(TOPIC, 1);
        publish(&bus, score("aa", 1.0));
        bus.append(TOPIC, 0, Bytes::new(), Bytes::from_static(b"[1,2")).unwrap();
        publish(&bus, score("bb", 1.0));

        let backend = RecordingBackend::new();
        let mut job_id = JobId(0);
        let report = pipeline(&bus).consume(&backend, &mut job_id).await.unwrap();

        assert_eq!(report.consumed, 3);
        assert_eq!(report.malformed, 1);
        assert_eq!(report.applied, 2);
    }

    #[tokio::test]
    async fn test_partial_batch_applied_on_offset_reset() {
        let bus = MemoryBus::new().with_retention(3);
        bus.create_topic(TOPIC, 2);

        // Partition 0 keeps everything it gets; partition 1 overflows retention.
        let encode = |m: FrontierMessage| JsonCodec::new().encode(&m).unwrap();
        bus.append(TOPIC, 0, Bytes::new(), encode(score("aa", 0.5))).unwrap();
        for i in 0..5 {
            bus.append(TOPIC, 1, Bytes::new(), encode(score(&format!("p1-{i}"), 0.1)))
                .unwrap();
        }

        let backend = RecordingBackend::new();
        let mut job_id = JobId(0);
        let mut pipeline = pipeline(&bus);
        let report = pipeline.consume(&backend, &mut job_id).await.unwrap();

        // Partition 0 is read first, then partition 1 reports the invalid offset.
        assert!(report.offset_reset);
        assert_eq!(report.consumed, 1);
        let batches = applied_batches(&backend);
        assert_eq!(batches.len(), 1);
        assert!(batches[0].get("aa").is_some());

        bus.append(TOPIC, 1, Bytes::new(), encode(score("after", 0.9))).unwrap();
        let report = pipeline.consume(&backend, &mut job_id).await.unwrap();
        assert!(!report.offset_reset);
        assert_eq!(report.consumed, 1);
        assert!(applied_batches(&backend)[1].get("after").is_some());
    }
}
