//! The frontier worker: the three pipelines behind one [`DutyRunner`].
//!
//! The worker owns the current job id. Only the scoring pipeline changes it;
//! the incoming pipeline filters on it and the batch generator tags outgoing
//! requests with it. Since the scheduler runs one duty at a time, no lock
//! guards it.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::info;

use crate::backend::FrontierBackend;
use crate::batch::{BatchConfig, BatchGenerator};
use crate::bus::{OffsetFetcher, StreamConsumer, StreamProducer};
use crate::codec::{Codec, JsonCodec};
use crate::config::WorkerConfig;
use crate::incoming::IncomingPipeline;
use crate::lag::LagMonitor;
use crate::memory::MemoryBus;
use crate::scheduler::{Duty, DutyError, DutyReport, DutyRunner, Scheduler, SchedulerHandle};
use crate::scoring::ScoringPipeline;
use crate::stats::{StatsPublisher, WorkerStats};
use crate::types::JobId;

/// Connections to the message bus, one per role.
pub struct BusClients {
    pub incoming: Box<dyn StreamConsumer>,
    pub scoring: Box<dyn StreamConsumer>,
    pub producer: Arc<dyn StreamProducer>,
    pub offsets: Arc<dyn OffsetFetcher>,
}

impl BusClients {
    /// Clients for an in-process bus. Topics are created if missing.
    pub fn memory(bus: &MemoryBus, config: &WorkerConfig) -> Self {
        bus.create_topic(&config.incoming_topic, 1);
        bus.create_topic(&config.scoring_topic, 1);
        bus.create_topic(&config.outgoing_topic, config.outgoing_partitions);

        Self {
            incoming: Box::new(bus.consumer(&config.group, &config.incoming_topic)),
            scoring: Box::new(bus.consumer(&config.group, &config.scoring_topic)),
            producer: Arc::new(bus.clone()),
            offsets: Arc::new(bus.clone()),
        }
    }
}

pub struct FrontierWorker {
    backend: Arc<dyn FrontierBackend>,
    incoming: IncomingPipeline,
    scoring: ScoringPipeline,
    batches: BatchGenerator,
    job_id: JobId,
    stats: StatsPublisher,
}

impl FrontierWorker {
    /// Assemble a worker from bus clients and a backend.
    ///
    /// Returns the stats receiver alongside; it is the only way to observe
    /// the worker once it has been handed to the scheduler.
    pub fn new(
        config: &WorkerConfig,
        clients: BusClients,
        backend: Arc<dyn FrontierBackend>,
    ) -> (Self, watch::Receiver<WorkerStats>) {
        let codec: Arc<dyn Codec> = Arc::new(JsonCodec::new());
        Self::with_codec(config, clients, backend, codec)
    }

    pub fn with_codec(
        config: &WorkerConfig,
        clients: BusClients,
        backend: Arc<dyn FrontierBackend>,
        codec: Arc<dyn Codec>,
    ) -> (Self, watch::Receiver<WorkerStats>) {
        let incoming = IncomingPipeline::new(clients.incoming, Arc::clone(&codec), config.incoming.clone());
        let scoring = ScoringPipeline::new(clients.scoring, Arc::clone(&codec), config.scoring.clone());

        let lag = LagMonitor::new(clients.offsets, config.outgoing_topic.clone(), config.group.clone());
        let batches = BatchGenerator::new(
            lag,
            clients.producer,
            codec,
            BatchConfig {
                outgoing_topic: config.outgoing_topic.clone(),
                max_next_requests: config.max_next_requests,
            },
        );

        let (stats, stats_rx) = StatsPublisher::new();
        let worker = Self {
            backend,
            incoming,
            scoring,
            batches,
            job_id: JobId::default(),
            stats,
        };
        (worker, stats_rx)
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Wrap the worker in a scheduler built from `config`.
    pub fn into_scheduler(self, config: &WorkerConfig) -> (Scheduler<Self>, SchedulerHandle) {
        Scheduler::new(self, config.scheduler.clone())
    }

    async fn consume_incoming(&mut self) -> Result<usize> {
        let report = self.incoming.consume(self.backend.as_ref(), self.job_id).await?;
        self.stats.update(|s| s.record_incoming(report.consumed));
        Ok(report.consumed)
    }

    async fn consume_scoring(&mut self) -> Result<usize> {
        let report = self
            .scoring
            .consume(self.backend.as_ref(), &mut self.job_id)
            .await?;
        let job_id = self.job_id;
        self.stats.update(|s| {
            s.record_scoring(report.consumed);
            s.job_id = job_id;
        });
        Ok(report.consumed)
    }

    async fn new_batch(&mut self) -> Result<usize> {
        let report = self.batches.generate(self.backend.as_ref(), self.job_id).await?;
        if report.is_noop() {
            return Ok(0);
        }
        self.stats.update(|s| s.record_batch(report.attempted));
        info!(
            job_id = %self.job_id,
            size = report.attempted,
            published = report.published,
            "new batch generated"
        );
        Ok(report.attempted)
    }
}

#[async_trait]
impl DutyRunner for FrontierWorker {
    async fn run_duty(&mut self, duty: Duty) -> Result<DutyReport, DutyError> {
        let outcome = match duty {
            Duty::ConsumeIncoming => self.consume_incoming().await,
            Duty::ConsumeScoring => self.consume_scoring().await,
            Duty::GenerateBatch => self.new_batch().await,
        };
        outcome
            .map(|processed| DutyReport { duty, processed })
            .map_err(|source| DutyError::new(duty, source))
    }
}
