//! Test doubles for the worker's collaborators.
//!
//! `RecordingBackend` records every backend call so tests can assert on
//! exactly what the pipelines dispatched, without a real frontier.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;

use crate::backend::FrontierBackend;
use crate::codec::{Codec, CodecError, JsonCodec};
use crate::messages::FrontierMessage;
use crate::types::{Request, Response, ScoreBatch};

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    AddSeeds(Vec<Request>),
    PageCrawled { response: Response, links: Vec<Request> },
    RequestError { request: Request, error: String },
    UpdateScore(ScoreBatch),
    GetNextRequests { max_count: usize, partitions: Vec<u32> },
}

/// Backend that records calls and serves queued requests.
#[derive(Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<BackendCall>>,
    next_requests: Mutex<VecDeque<Request>>,
    fail_next: Mutex<Option<String>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests handed out by later `get_next_requests` calls.
    pub fn queue_requests(&self, requests: Vec<Request>) {
        self.next_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(requests);
    }

    /// Make the next call fail with `message`.
    pub fn fail_next(&self, message: &str) {
        *self.fail_next.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.to_string());
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn page_crawled_urls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::PageCrawled { response, .. } => Some(response.url),
                _ => None,
            })
            .collect()
    }

    pub fn request_error_urls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::RequestError { request, .. } => Some(request.url),
                _ => None,
            })
            .collect()
    }

    pub fn get_next_requests_calls(&self) -> Vec<Vec<u32>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::GetNextRequests { partitions, .. } => Some(partitions),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: BackendCall) -> Result<()> {
        if let Some(message) = self.fail_next.lock().unwrap_or_else(|e| e.into_inner()).take() {
            return Err(anyhow!(message));
        }
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
        Ok(())
    }
}

#[async_trait]
impl FrontierBackend for RecordingBackend {
    async fn add_seeds(&self, seeds: Vec<Request>) -> Result<()> {
        self.record(BackendCall::AddSeeds(seeds))
    }

    async fn page_crawled(&self, response: Response, links: Vec<Request>) -> Result<()> {
        self.record(BackendCall::PageCrawled { response, links })
    }

    async fn request_error(&self, request: Request, error: String) -> Result<()> {
        self.record(BackendCall::RequestError { request, error })
    }

    async fn update_score(&self, batch: ScoreBatch) -> Result<()> {
        self.record(BackendCall::UpdateScore(batch))
    }

    async fn get_next_requests(&self, max_count: usize, partitions: &[u32]) -> Result<Vec<Request>> {
        self.record(BackendCall::GetNextRequests {
            max_count,
            partitions: partitions.to_vec(),
        })?;
        let mut queued = self.next_requests.lock().unwrap_or_else(|e| e.into_inner());
        let take = max_count.min(queued.len());
        Ok(queued.drain(..take).collect())
    }
}

/// JSON codec that refuses to encode requests whose URL contains a marker.
pub struct FailingRequestCodec {
    marker: String,
    inner: JsonCodec,
}

impl FailingRequestCodec {
    pub fn new(marker: &str) -> Self {
        Self {
            marker: marker.to_string(),
            inner: JsonCodec::new(),
        }
    }
}

impl Codec for FailingRequestCodec {
    fn decode(&self, bytes: &[u8]) -> Result<FrontierMessage, CodecError> {
        self.inner.decode(bytes)
    }

    fn encode(&self, message: &FrontierMessage) -> Result<Bytes, CodecError> {
        self.inner.encode(message)
    }

    fn encode_request(&self, request: &Request) -> Result<Bytes, CodecError> {
        if request.url.contains(&self.marker) {
            return Err(CodecError::Encode {
                what: "request",
                reason: format!("refusing {}", request.url),
            });
        }
        self.inner.encode_request(request)
    }

    fn decode_request(&self, bytes: &[u8]) -> Result<Request, CodecError> {
        self.inner.decode_request(bytes)
    }
}
