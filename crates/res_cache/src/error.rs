//! Cache error types.

use nats_client::BusError;
use res_protocol::{GetError, ProtocolError, ResError};
use thiserror::Error;

/// An error surfaced to subscribers through `loaded`.
///
/// `Clone` so a single failed get can be fanned out to every waiting
/// subscriber.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CacheError {
    /// No reply arrived within the bus reply timeout.
    #[error("request timed out")]
    Timeout,

    /// The bus transport failed.
    #[error("messaging error: {0}")]
    Bus(String),

    /// The reply could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The service replied with an error.
    #[error(transparent)]
    Resource(#[from] ResError),
}

impl CacheError {
    /// Whether this is the service's `system.notFound` error, which
    /// gets special treatment during reset.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::Resource(err) if err.is_not_found())
    }
}

impl From<BusError> for CacheError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Timeout => CacheError::Timeout,
            other => CacheError::Bus(other.to_string()),
        }
    }
}

impl From<ProtocolError> for CacheError {
    fn from(err: ProtocolError) -> Self {
        CacheError::Protocol(err.to_string())
    }
}

impl From<GetError> for CacheError {
    fn from(err: GetError) -> Self {
        match err {
            GetError::Resource(err) => CacheError::Resource(err),
            GetError::Protocol(err) => err.into(),
        }
    }
}
