use async_trait::async_trait;
use anyhow::Result;

use crate::types::{Request, Response, ScoreBatch};

// ============================================================================
// FRONTIER BACKEND: crawl state, dedup and prioritization (external)
// ============================================================================

/// The frontier engine the worker feeds and drains.
///
/// Implementations own all crawl state. The worker calls these methods from
/// a single task, one at a time.
#[async_trait]
pub trait FrontierBackend: Send + Sync {
    async fn add_seeds(&self, seeds: Vec<Request>) -> Result<()>;

    async fn page_crawled(&self, response: Response, links: Vec<Request>) -> Result<()>;

    async fn request_error(&self, request: Request, error: String) -> Result<()>;

    /// Apply a whole cycle's worth of score updates at once.
    async fn update_score(&self, batch: ScoreBatch) -> Result<()>;

    /// Up to `max_count` requests, drawn only from `partitions`.
    async fn get_next_requests(&self, max_count: usize, partitions: &[u32]) -> Result<Vec<Request>>;
}
