//! Resource cache and subscription coordinator.
//!
//! Sits between client-facing sessions and the messaging bus: it
//! de-duplicates concurrent subscriptions to the same resource,
//! fetches and caches model/collection state, applies change events
//! under a strict per-resource ordering, resynchronizes after bus
//! reconnects, and coalesces query resources that normalize to the
//! same canonical form.
//!
//! ## Architecture
//!
//! ```text
//! bus: event.<name>.>          get.<name>
//!         ↓                        ↕
//! Cache (name → EventSubscription, DashMap)
//!         ↓
//! EventSubscription: FIFO work queue + per-name lock
//!         ↓
//! ResourceSub (per query): cached Model/Collection + subscribers
//! ```
//!
//! Every mutation of cached state runs as a work item on the owning
//! coordinator, one at a time in submission order. Cached containers
//! are replaced, never mutated, so subscribers can hold a revision
//! while the cache moves on.

pub mod cache;
pub mod error;
pub mod event;
pub mod handle;
pub mod model;
pub mod traits;

mod diff;
mod event_subscription;
mod resource;

#[cfg(test)]
mod testutil;

pub use cache::{Cache, CacheConfig};
pub use error::CacheError;
pub use event::{EventKind, ResourceEvent};
pub use handle::{ResourceGuard, ResourceHandle, ResourceType};
pub use model::{Collection, Model};
pub use traits::Subscriber;
