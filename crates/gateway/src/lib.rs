//! Realtime resource gateway service.
//!
//! Wires the bus client and the resource cache together with
//! configuration, logging and metrics. Client-facing frontends (HTTP,
//! WebSocket) embed [`Service`] and subscribe their sessions through
//! the cache.

pub mod service;

pub use service::{Service, ServiceConfig};
