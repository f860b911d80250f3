//! Subscriber-facing handles to cached resources.

use crate::error::CacheError;
use crate::event_subscription::{EventSubState, EventSubscription};
use crate::model::{Collection, Model};
use crate::resource;
use crate::traits::Subscriber;
use parking_lot::MutexGuard;
use std::fmt;
use std::sync::Arc;

/// The kind of state a resource resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Model,
    Collection,
    Error,
}

/// A handle to a (resource name, query) subscription.
///
/// The handle tracks the query as requested; if the service normalized
/// it, reads transparently follow the link to the canonical entry.
#[derive(Clone)]
pub struct ResourceHandle {
    pub(crate) esub: Arc<EventSubscription>,
    pub(crate) query: String,
}

impl ResourceHandle {
    pub fn resource_name(&self) -> &str {
        &self.esub.resource_name
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Acquire the resource's coordination lock for reading.
    ///
    /// While the guard is alive no event can be applied under this
    /// resource name, so references read through it are stable.
    /// Dropping the guard releases the lock.
    pub fn access(&self) -> ResourceGuard<'_> {
        ResourceGuard {
            guard: self.esub.state.lock(),
            query: &self.query,
        }
    }

    /// The resolved state kind, or `None` while the resource is still
    /// loading or after it has been dropped.
    pub fn resource_type(&self) -> Option<ResourceType> {
        self.access().resource_type()
    }

    /// The load error, if the resource is in the error state.
    pub fn error(&self) -> Option<CacheError> {
        self.access().error().cloned()
    }

    /// Cancel a subscriber's subscription. Serialized with event
    /// application; an event whose dispatch began before this is
    /// processed may still reach the subscriber.
    pub fn unsubscribe(&self, subscriber: &Arc<dyn Subscriber>) {
        let query = self.query.clone();
        let key = resource::subscriber_key(subscriber);
        self.esub.enqueue(Box::new(move |ctx| {
            resource::remove_subscriber(ctx, &query, key);
        }));
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("resource", &self.esub.resource_name)
            .field("query", &self.query)
            .finish()
    }
}

/// Scoped read access to a cached resource.
pub struct ResourceGuard<'a> {
    guard: MutexGuard<'a, EventSubState>,
    query: &'a str,
}

impl ResourceGuard<'_> {
    /// The cached model, if the resource resolved to one.
    pub fn model(&self) -> Option<&Arc<Model>> {
        self.guard.resolve(self.query).and_then(|rs| rs.model.as_ref())
    }

    /// The cached collection, if the resource resolved to one.
    pub fn collection(&self) -> Option<&Arc<Collection>> {
        self.guard
            .resolve(self.query)
            .and_then(|rs| rs.collection.as_ref())
    }

    pub fn resource_type(&self) -> Option<ResourceType> {
        self.guard.resolve(self.query).and_then(|rs| rs.resource_type())
    }

    pub fn error(&self) -> Option<&CacheError> {
        self.guard.resolve(self.query).and_then(|rs| rs.err.as_ref())
    }
}
