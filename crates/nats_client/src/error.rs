//! Bus transport errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    /// No reply arrived within the configured timeout.
    #[error("request timed out")]
    Timeout,

    /// Nothing is listening on the request subject.
    #[error("no responders for {0}")]
    NoResponders(String),

    /// The connection failed or was lost mid-request.
    #[error("connection error: {0}")]
    Connection(String),

    /// The subscription could not be established.
    #[error("subscription error: {0}")]
    Subscribe(String),
}

pub type Result<T> = std::result::Result<T, BusError>;
