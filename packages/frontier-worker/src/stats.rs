//! Worker observability counters.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::types::JobId;

/// Last-known counters for each duty. Overwritten in place; no history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStats {
    pub job_id: JobId,
    pub last_consumed: Option<usize>,
    pub last_consumption_run: Option<DateTime<Utc>>,
    pub last_consumed_scoring: Option<usize>,
    pub last_consumption_run_scoring: Option<DateTime<Utc>>,
    pub last_batch_size: Option<usize>,
    pub batches_after_start: u64,
    pub last_batch_generated: Option<DateTime<Utc>>,
}

impl WorkerStats {
    pub fn record_incoming(&mut self, consumed: usize) {
        self.last_consumed = Some(consumed);
        self.last_consumption_run = Some(Utc::now());
    }

    pub fn record_scoring(&mut self, consumed: usize) {
        self.last_consumed_scoring = Some(consumed);
        self.last_consumption_run_scoring = Some(Utc::now());
    }

    pub fn record_batch(&mut self, size: usize) {
        self.last_batch_size = Some(size);
        self.batches_after_start += 1;
        self.last_batch_generated = Some(Utc::now());
    }
}

/// Owner side of the stats. Only the worker task writes.
#[derive(Debug)]
pub struct StatsPublisher {
    stats: WorkerStats,
    tx: watch::Sender<WorkerStats>,
}

impl StatsPublisher {
    pub fn new() -> (Self, watch::Receiver<WorkerStats>) {
        let (tx, rx) = watch::channel(WorkerStats::default());
        (
            Self {
                stats: WorkerStats::default(),
                tx,
            },
            rx,
        )
    }

    /// Mutate the stats and publish the result to every reader.
    pub fn update(&mut self, f: impl FnOnce(&mut WorkerStats)) {
        f(&mut self.stats);
        self.tx.send_replace(self.stats.clone());
    }
}
