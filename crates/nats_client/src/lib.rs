//! Messaging bus client.
//!
//! Defines the [`BusClient`] interface the resource cache talks to —
//! request/reply with a reply timeout, subject subscriptions and the
//! reconnect signal — plus the NATS core implementation.

pub mod client;
pub mod error;
pub mod traits;

pub use client::{NatsClient, DEFAULT_REQUEST_TIMEOUT};
pub use error::BusError;
pub use traits::{BusClient, BusSubscription, EventHandler, ReconnectHandler, ReplyCallback};
