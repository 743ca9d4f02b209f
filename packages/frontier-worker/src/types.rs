//! Core data model shared by the pipelines.
//!
//! Requests and responses travel over the bus in both directions, so every
//! type here is serde-serializable. The metadata map is schemaless
//! (`serde_json::Map`) and mostly owned by the backend; the worker itself
//! only reads and writes [`META_FINGERPRINT`] and [`META_JOB_ID`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Metadata key holding the request fingerprint.
pub const META_FINGERPRINT: &str = "fingerprint";

/// Metadata key holding the job id a request was issued under.
pub const META_JOB_ID: &str = "jid";

/// Length of fingerprints produced by [`fingerprint_url`].
pub const FINGERPRINT_LEN: usize = 40;

// ============================================================================
// Job generation
// ============================================================================

/// Identifier of the current crawl generation.
///
/// Results carrying a different job id were produced for an older generation
/// and are dropped on arrival.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Compute the canonical fingerprint for a URL.
///
/// First 40 hex characters of the SHA-256 digest of the URL string.
pub fn fingerprint_url(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(FINGERPRINT_LEN);
    encoded
}

// ============================================================================
// Requests / responses
// ============================================================================

fn default_method() -> String {
    "GET".to_string()
}

/// A URL to crawl plus the metadata the frontier attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl Request {
    /// Build a GET request with its fingerprint already set.
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let mut meta = Map::new();
        meta.insert(
            META_FINGERPRINT.to_string(),
            Value::String(fingerprint_url(&url)),
        );
        Self {
            url,
            method: default_method(),
            headers: BTreeMap::new(),
            meta,
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_job_id(mut self, job_id: JobId) -> Self {
        self.set_job_id(job_id);
        self
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.meta.get(META_FINGERPRINT).and_then(Value::as_str)
    }

    /// Job id the request was tagged with, if any.
    pub fn job_id(&self) -> Option<JobId> {
        self.meta.get(META_JOB_ID).and_then(Value::as_u64).map(JobId)
    }

    pub fn set_job_id(&mut self, job_id: JobId) {
        self.meta
            .insert(META_JOB_ID.to_string(), Value::from(job_id.get()));
    }

    /// Fingerprint for log context; never empty.
    pub fn fingerprint_or_unknown(&self) -> &str {
        self.fingerprint().unwrap_or("<none>")
    }
}

/// Result of fetching a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub url: String,
    #[serde(default = "default_status")]
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    /// The request this response answers. Its metadata is the response's metadata.
    pub request: Request,
}

fn default_status() -> u16 {
    200
}

impl Response {
    pub fn new(request: Request, status_code: u16) -> Self {
        Self {
            url: request.url.clone(),
            status_code,
            headers: BTreeMap::new(),
            body: None,
            request,
        }
    }

    pub fn meta(&self) -> &Map<String, Value> {
        &self.request.meta
    }

    pub fn job_id(&self) -> Option<JobId> {
        self.request.job_id()
    }
}

// ============================================================================
// Scoring
// ============================================================================

/// A new score for a fingerprint, optionally asking for it to be (re)scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreUpdate {
    pub fingerprint: String,
    pub score: f64,
    pub url: String,
    pub schedule: bool,
}

/// Score updates collected during one scoring cycle.
///
/// Keyed by fingerprint; a later update for the same fingerprint replaces the
/// earlier one outright.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreBatch {
    updates: HashMap<String, ScoreUpdate>,
}

impl ScoreBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the update for `update.fingerprint`.
    pub fn upsert(&mut self, update: ScoreUpdate) {
        self.updates.insert(update.fingerprint.clone(), update);
    }

    pub fn get(&self, fingerprint: &str) -> Option<&ScoreUpdate> {
        self.updates.get(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

impl IntoIterator for ScoreBatch {
    type Item = (String, ScoreUpdate);
    type IntoIter = std::collections::hash_map::IntoIter<String, ScoreUpdate>;

    fn into_iter(self) -> Self::IntoIter {
        self.updates.into_iter()
    }
}
