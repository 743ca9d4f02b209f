//! Messages exchanged over the incoming and scoring streams.

use serde::{Deserialize, Serialize};

use crate::types::{JobId, Request, Response, ScoreUpdate};

/// Every message kind the worker understands.
///
/// The incoming stream carries `AddSeeds`, `PageCrawled` and `RequestError`;
/// the scoring stream carries `UpdateScore` and `NewJobId`. A pipeline that
/// receives a kind belonging to the other stream ignores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrontierMessage {
    AddSeeds {
        seeds: Vec<Request>,
    },
    PageCrawled {
        response: Response,
        links: Vec<Request>,
    },
    RequestError {
        request: Request,
        error: String,
    },
    UpdateScore(ScoreUpdate),
    NewJobId {
        job_id: JobId,
    },
}

impl FrontierMessage {
    /// Wire name of the message kind, used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            FrontierMessage::AddSeeds { .. } => "add_seeds",
            FrontierMessage::PageCrawled { .. } => "page_crawled",
            FrontierMessage::RequestError { .. } => "request_error",
            FrontierMessage::UpdateScore(_) => "update_score",
            FrontierMessage::NewJobId { .. } => "new_job_id",
        }
    }
}
