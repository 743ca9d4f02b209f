//! Wire codec seam.
//!
//! The worker never looks at message bytes itself; it hands them to a
//! [`Codec`]. [`JsonCodec`] is the codec shipped with the crate.

use bytes::Bytes;
use thiserror::Error;

use crate::messages::FrontierMessage;
use crate::types::Request;

/// Failure to decode or encode a message.
///
/// Both variants are item-level faults: the pipelines log them and move on
/// to the next message.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("failed to encode {what}: {reason}")]
    Encode { what: &'static str, reason: String },
}

/// Encodes and decodes frontier messages.
pub trait Codec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<FrontierMessage, CodecError>;

    fn encode(&self, message: &FrontierMessage) -> Result<Bytes, CodecError>;

    /// Encode a request for the outgoing stream.
    fn encode_request(&self, request: &Request) -> Result<Bytes, CodecError>;

    fn decode_request(&self, bytes: &[u8]) -> Result<Request, CodecError>;
}

/// JSON codec using `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for JsonCodec {
    fn decode(&self, bytes: &[u8]) -> Result<FrontierMessage, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    fn encode(&self, message: &FrontierMessage) -> Result<Bytes, CodecError> {
        serde_json::to_vec(message)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode {
                what: message.kind(),
                reason: e.to_string(),
            })
    }

    fn encode_request(&self, request: &Request) -> Result<Bytes, CodecError> {
        serde_json::to_vec(request)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode {
                what: "request",
                reason: e.to_string(),
            })
    }

    fn decode_request(&self, bytes: &[u8]) -> Result<Request, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))
    }
}
