//! The subscriber interface consumed by the cache.

use crate::error::CacheError;
use crate::event::ResourceEvent;
use crate::handle::ResourceHandle;

/// A consumer of a cached resource, typically a client session.
///
/// Callbacks are invoked with the resource's coordination lock
/// released, so they may take their time, but they must not block on
/// an operation that itself waits for this resource's work queue.
/// Unsubscribing from inside a callback is always safe: it only
/// enqueues.
pub trait Subscriber: Send + Sync {
    /// Called exactly once, when the resource has been loaded or the
    /// load has failed. A subscriber that unsubscribes while the load
    /// is being processed still receives this call.
    fn loaded(&self, result: Result<ResourceHandle, CacheError>);

    /// Called for every event applied after `loaded`, and never after
    /// a delete event has been delivered.
    fn event(&self, event: &ResourceEvent);

    /// Called when access rights for the resource may have changed and
    /// authorization should be re-checked.
    fn reaccess(&self);
}
