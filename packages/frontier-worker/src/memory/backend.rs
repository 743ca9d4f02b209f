//! Minimal in-process frontier backend.
//!
//! Keeps a score-ordered queue per partition with fingerprint dedup. Seeds
//! enter at [`SEED_SCORE`], discovered links at [`LINK_SCORE`]; score updates
//! re-rank queued requests or schedule new ones. Partitions are computed
//! with the same domain-name CRC32 mapping the batch generator publishes
//! with, so a partition scope passed to `get_next_requests` matches what
//! the worker will publish to.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::backend::FrontierBackend;
use crate::batch::PartitionKey;
use crate::partitioner::{Crc32NamePartitioner, Partitioner};
use crate::types::{fingerprint_url, Request, Response, ScoreBatch, META_FINGERPRINT};

pub const SEED_SCORE: f64 = 1.0;
pub const LINK_SCORE: f64 = 0.5;

#[derive(Debug)]
struct Queued {
    request: Request,
    score: f64,
    partition: u32,
    /// Insertion order; breaks score ties.
    seq: u64,
}

#[derive(Debug, Default)]
struct FrontierState {
    queued: HashMap<String, Queued>,
    seen: HashSet<String>,
    crawled: HashSet<String>,
    errors: HashMap<String, String>,
    next_seq: u64,
}

pub struct MemoryBackend {
    state: Mutex<FrontierState>,
    partitions: u32,
    partitioner: Crc32NamePartitioner,
}

impl MemoryBackend {
    /// `partitions` must match the outgoing topic's partition count.
    pub fn new(partitions: u32) -> Self {
        Self {
            state: Mutex::new(FrontierState::default()),
            partitions: partitions.max(1),
            partitioner: Crc32NamePartitioner::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FrontierState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn partition_for(&self, url: &str) -> Result<u32> {
        let key = PartitionKey::for_url(url);
        Ok(self.partitioner.partition(key.as_bytes(), self.partitions)?)
    }

    /// Queue `request` unless its fingerprint has been seen before.
    fn enqueue(&self, state: &mut FrontierState, mut request: Request, score: f64) -> Result<bool> {
        let fingerprint = match request.fingerprint() {
            Some(fp) => fp.to_string(),
            None => {
                let fp = fingerprint_url(&request.url);
                request
                    .meta
                    .insert(META_FINGERPRINT.to_string(), Value::String(fp.clone()));
                fp
            }
        };
        if !state.seen.insert(fingerprint.clone()) {
            return Ok(false);
        }

        let partition = self.partition_for(&request.url)?;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queued.insert(
            fingerprint,
            Queued {
                request,
                score,
                partition,
                seq,
            },
        );
        Ok(true)
    }

    pub fn queued_len(&self) -> usize {
        self.lock().queued.len()
    }

    pub fn crawled_len(&self) -> usize {
        self.lock().crawled.len()
    }

    pub fn error_count(&self) -> usize {
        self.lock().errors.len()
    }

    /// Current score of a queued fingerprint.
    pub fn score_of(&self, fingerprint: &str) -> Option<f64> {
        self.lock().queued.get(fingerprint).map(|q| q.score)
    }
}

#[async_trait]
impl FrontierBackend for MemoryBackend {
    async fn add_seeds(&self, seeds: Vec<Request>) -> Result<()> {
        let mut state = self.lock();
        for seed in seeds {
            self.enqueue(&mut state, seed, SEED_SCORE)?;
        }
        Ok(())
    }

    async fn page_crawled(&self, response: Response, links: Vec<Request>) -> Result<()> {
        let mut state = self.lock();
        if let Some(fp) = response.request.fingerprint() {
            state.queued.remove(fp);
            state.crawled.insert(fp.to_string());
        }
        let mut added = 0;
        for link in links {
            if self.enqueue(&mut state, link, LINK_SCORE)? {
                added += 1;
            }
        }
        debug!(url = %response.url, added, "links queued");
        Ok(())
    }

    async fn request_error(&self, request: Request, error: String) -> Result<()> {
        let mut state = self.lock();
        let fp = request
            .fingerprint()
            .map(str::to_owned)
            .unwrap_or_else(|| fingerprint_url(&request.url));
        state.queued.remove(&fp);
        state.errors.insert(fp, error);
        Ok(())
    }

    async fn update_score(&self, batch: ScoreBatch) -> Result<()> {
        let mut state = self.lock();
        for (fingerprint, update) in batch {
            if let Some(queued) = state.queued.get_mut(&fingerprint) {
                queued.score = update.score;
                continue;
            }
            if update.schedule {
                state.seen.remove(&fingerprint);
                let request = Request::new(update.url)
                    .with_meta(META_FINGERPRINT, Value::String(fingerprint));
                self.enqueue(&mut state, request, update.score)?;
            }
        }
        Ok(())
    }

    async fn get_next_requests(&self, max_count: usize, partitions: &[u32]) -> Result<Vec<Request>> {
        let mut state = self.lock();
        let wanted: HashSet<u32> = partitions.iter().copied().collect();

        let mut candidates: Vec<(&String, f64, u64)> = state
            .queued
            .iter()
            .filter(|(_, q)| wanted.contains(&q.partition))
            .map(|(fp, q)| (fp, q.score, q.seq))
            .collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.2.cmp(&b.2)));

        let chosen: Vec<String> = candidates
            .into_iter()
            .take(max_count)
            .map(|(fp, _, _)| fp.clone())
            .collect();

        Ok(chosen
            .iter()
            .filter_map(|fp| state.queued.remove(fp))
            .map(|q| q.request)
            .collect())
    }
}
