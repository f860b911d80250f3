//! Protocol error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known RES error codes.
pub mod codes {
    /// The resource was not found.
    pub const NOT_FOUND: &str = "system.notFound";
    /// The request timed out.
    pub const TIMEOUT: &str = "system.timeout";
    /// An unspecified internal error.
    pub const INTERNAL_ERROR: &str = "system.internalError";
}

/// An error returned by a backend service in a reply body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct ResError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ResError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    pub fn not_found() -> Self {
        Self::new(codes::NOT_FOUND, "Not found")
    }

    pub fn is_not_found(&self) -> bool {
        self.code == codes::NOT_FOUND
    }
}

/// A malformed or unexpected wire payload.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid payload: {0}")]
    Invalid(String),

    #[error("delete action is only valid in change event properties")]
    UnexpectedDelete,
}

/// Outcome of decoding a get reply: either a service-reported error or
/// a payload the gateway could not make sense of.
#[derive(Debug, Error)]
pub enum GetError {
    #[error(transparent)]
    Resource(ResError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
