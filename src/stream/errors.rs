// src/stream/errors.rs

use serde_json::{Error as SerdeError, Value};
use std::time::Duration;
use thiserror::Error;

use super::message::RequestId;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("JSON-RPC stream - classification error: {0}")]
    Classification(String),

    #[error("JSON-RPC stream - Received response with unknown id \"{0}\".")]
    UnknownResponseId(String),

    #[error("JSON-RPC stream - request id \"{0}\" is already pending")]
    DuplicateRegistration(RequestId),

    #[error("JSON-RPC stream - dispatch failed: {0}")]
    DispatchFailure(String),

    #[error("JSON-RPC stream - no dispatcher configured for request \"{0}\"")]
    NoDispatcher(String),

    #[error("JSON-RPC stream - transport closed")]
    TransportClosed,

    #[error("JSON-RPC stream - completion handle dropped before response arrived")]
    CompletionDropped,

    #[error("JSON-RPC stream - call timed out after {0:?}")]
    Timeout(Duration),

    #[error("JSON-RPC stream - peer answered with error: {0}")]
    Remote(Value),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] SerdeError),
}

// Custom Result type for stream operations
pub type Result<T> = std::result::Result<T, StreamError>;

impl StreamError {
    /// Errors that only affect the message that produced them.
    pub fn is_per_message(&self) -> bool {
        matches!(
            self,
            StreamError::Classification(_)
                | StreamError::UnknownResponseId(_)
                | StreamError::DispatchFailure(_)
                | StreamError::NoDispatcher(_)
        )
    }
}
