//! The bus interface consumed by the resource cache.
//!
//! The cache funnels every reply and event into per-resource work
//! queues, so the interface is callback-shaped: the implementation
//! bridges onto whatever runtime it uses internally and the callbacks
//! must be cheap and non-blocking.

use crate::error::{BusError, Result};
use bytes::Bytes;
use std::sync::Arc;

/// Invoked exactly once with the reply bytes or a transport error.
pub type ReplyCallback = Box<dyn FnOnce(Result<Bytes>) + Send>;

/// Invoked for every message delivered on a subscribed subject, with
/// the full subject and the payload.
pub type EventHandler = Arc<dyn Fn(&str, Bytes) + Send + Sync>;

/// Invoked after the bus link has been re-established.
pub type ReconnectHandler = Box<dyn Fn() + Send + Sync>;

/// A messaging bus client.
pub trait BusClient: Send + Sync {
    /// Send a request and deliver the reply (or error) to `callback`.
    /// One delivery attempt; expiry of the reply timeout surfaces as
    /// [`BusError::Timeout`].
    fn send_request(&self, subject: &str, payload: Bytes, callback: ReplyCallback);

    /// Subscribe to a subject pattern. Every message published on a
    /// matching subject is passed to `handler` in delivery order.
    /// Dropping the returned guard releases the subscription.
    fn subscribe(
        &self,
        subject: &str,
        handler: EventHandler,
    ) -> std::result::Result<Box<dyn BusSubscription>, BusError>;

    /// Register a handler invoked after every reconnect.
    fn on_reconnect(&self, handler: ReconnectHandler);
}

/// Guard for an active subscription; dropping it unsubscribes.
pub trait BusSubscription: Send + Sync {}
