//! Per-(resource, query) cached state.
//!
//! Every function here runs as a work item on the owning
//! `EventSubscription`: one at a time, holding the coordination lock,
//! releasing it only around subscriber callbacks.

use crate::cache::CacheShared;
use crate::diff;
use crate::error::CacheError;
use crate::event::{EventKind, ResourceEvent};
use crate::event_subscription::{EventSubState, WorkCtx};
use crate::handle::{ResourceHandle, ResourceType};
use crate::model::{Collection, Model};
use crate::traits::Subscriber;
use bytes::Bytes;
use metrics::counter;
use nats_client::BusError;
use res_protocol::{
    create_get_request, decode_add_event, decode_change_event, decode_get_response,
    decode_legacy_change_event, decode_remove_event, encode_change_event, GetResult,
    ResourcePayload, Value,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubState {
    Requested,
    Model,
    Collection,
    Error,
}

pub(crate) struct SubEntry {
    pub subscriber: Arc<dyn Subscriber>,
    /// Whether `loaded` has been delivered; guards the exactly-once
    /// guarantee when normalization merges subscriber sets.
    pub loaded: bool,
}

/// Cached state and subscriber set for one (resource name, query).
pub(crate) struct ResourceSub {
    pub query: String,
    pub state: SubState,
    pub subs: HashMap<usize, SubEntry>,
    pub resetting: bool,
    /// Requested query strings that were normalized to this entry.
    pub links: Vec<String>,
    pub model: Option<Arc<Model>>,
    pub collection: Option<Arc<Collection>>,
    pub err: Option<CacheError>,
}

impl ResourceSub {
    pub fn new(query: String) -> Self {
        Self {
            query,
            state: SubState::Requested,
            subs: HashMap::new(),
            resetting: false,
            links: Vec::new(),
            model: None,
            collection: None,
            err: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, SubState::Model | SubState::Collection)
    }

    pub fn resource_type(&self) -> Option<ResourceType> {
        match self.state {
            SubState::Model => Some(ResourceType::Model),
            SubState::Collection => Some(ResourceType::Collection),
            SubState::Error => Some(ResourceType::Error),
            SubState::Requested => None,
        }
    }

    fn snapshot_subs(&self) -> Vec<Arc<dyn Subscriber>> {
        self.subs
            .values()
            .map(|entry| Arc::clone(&entry.subscriber))
            .collect()
    }
}

/// Identity of a subscriber instance.
pub(crate) fn subscriber_key(subscriber: &Arc<dyn Subscriber>) -> usize {
    Arc::as_ptr(subscriber) as *const () as usize
}

/// Attach a subscriber to the entry for `query`, creating the entry
/// and issuing the get request if this is the first interest in it.
pub(crate) fn add_subscriber(
    ctx: &mut WorkCtx<'_>,
    query: String,
    subscriber: Arc<dyn Subscriber>,
) {
    let esub = Arc::clone(ctx.esub);
    let key = subscriber_key(&subscriber);

    enum Next {
        Wait,
        Notify(ResourceHandle),
        Fetch(String),
    }

    let next = {
        let st = ctx.state();
        let canonical = st.canonical_key(&query);
        match st.resources.get_mut(&canonical) {
            Some(rs) => {
                if rs.subs.contains_key(&key) {
                    // Same subscriber instance subscribed twice; the
                    // caller's count increment is rolled back.
                    st.remove_count(1);
                    Next::Wait
                } else {
                    let loaded = rs.is_loaded();
                    rs.subs.insert(
                        key,
                        SubEntry {
                            subscriber: Arc::clone(&subscriber),
                            loaded,
                        },
                    );
                    if loaded {
                        Next::Notify(ResourceHandle {
                            esub: Arc::clone(&esub),
                            query: canonical,
                        })
                    } else {
                        // A get for this entry is already in flight.
                        Next::Wait
                    }
                }
            }
            None => {
                let mut rs = ResourceSub::new(canonical.clone());
                rs.subs.insert(
                    key,
                    SubEntry {
                        subscriber: Arc::clone(&subscriber),
                        loaded: false,
                    },
                );
                st.resources.insert(canonical.clone(), rs);
                Next::Fetch(canonical)
            }
        }
    };

    match next {
        Next::Wait => {}
        Next::Notify(handle) => {
            ctx.unlocked(|| subscriber.loaded(Ok(handle)));
        }
        Next::Fetch(canonical) => send_get(ctx, canonical),
    }
}

fn send_get(ctx: &mut WorkCtx<'_>, query: String) {
    let esub = Arc::clone(ctx.esub);
    let subject = format!("get.{}", esub.resource_name);
    let payload = create_get_request(&query);
    counter!("res_cache_get_requests_total").increment(1);
    ctx.cache.mq.send_request(
        &subject,
        payload,
        Box::new(move |reply| {
            esub.enqueue(Box::new(move |ctx| {
                process_get_response(ctx, &query, reply);
            }));
        }),
    );
}

/// Handle the reply to an entry's initial get request.
pub(crate) fn process_get_response(
    ctx: &mut WorkCtx<'_>,
    requested_query: &str,
    reply: Result<Bytes, BusError>,
) {
    let esub = Arc::clone(ctx.esub);
    let resource_name = esub.resource_name.clone();
    let decoded: Result<GetResult, CacheError> = reply
        .map_err(CacheError::from)
        .and_then(|payload| decode_get_response(&payload).map_err(CacheError::from));

    match decoded {
        Err(err) => {
            let sublist = {
                let st = ctx.state();
                let Some(rs) = st.resources.get_mut(requested_query) else {
                    return;
                };
                rs.state = SubState::Error;
                rs.err = Some(err.clone());
                let sublist: Vec<_> = rs.subs.drain().map(|(_, entry)| entry.subscriber).collect();
                unregister(st, requested_query);
                st.remove_count(sublist.len() as u64);
                sublist
            };
            warn!(resource = %resource_name, error = %err, "get request failed");
            counter!("res_cache_get_errors_total").increment(1);
            ctx.unlocked(|| {
                for sub in &sublist {
                    sub.loaded(Err(err.clone()));
                }
            });
        }
        Ok(result) => {
            let (canonical, sublist) = {
                let st = ctx.state();
                if !st.resources.contains_key(requested_query) {
                    // Every subscriber unsubscribed while the request
                    // was in flight and the entry is already gone.
                    debug!(resource = %resource_name, "get reply for dropped entry ignored");
                    return;
                }

                // A normalized query in the reply redirects this entry
                // to the canonical one, carrying the subscribers over.
                let (canonical, pending) = if result.query != requested_query {
                    let Some(mut old) = st.resources.remove(requested_query) else {
                        return;
                    };
                    debug!(
                        resource = %resource_name,
                        from = %requested_query,
                        to = %result.query,
                        "query normalized"
                    );
                    st.links
                        .insert(requested_query.to_string(), result.query.clone());
                    let pending: Vec<usize> = old.subs.keys().copied().collect();
                    let nrs = st
                        .resources
                        .entry(result.query.clone())
                        .or_insert_with(|| ResourceSub::new(result.query.clone()));
                    nrs.links.push(requested_query.to_string());
                    for (key, entry) in old.subs.drain() {
                        nrs.subs.entry(key).or_insert(entry);
                    }
                    (result.query.clone(), pending)
                } else {
                    let pending = st
                        .resources
                        .get(requested_query)
                        .map(|rs| {
                            rs.subs
                                .iter()
                                .filter(|(_, entry)| !entry.loaded)
                                .map(|(key, _)| *key)
                                .collect()
                        })
                        .unwrap_or_default();
                    (requested_query.to_string(), pending)
                };

                let Some(rs) = st.resources.get_mut(&canonical) else {
                    return;
                };
                // A concurrent request for the canonical query may
                // already have loaded the state; keep it and only
                // notify the waiting subscribers.
                if !rs.is_loaded() {
                    match result.payload {
                        ResourcePayload::Model(values) => {
                            rs.model = Some(Arc::new(Model::new(values)));
                            rs.state = SubState::Model;
                        }
                        ResourcePayload::Collection(values) => {
                            rs.collection = Some(Arc::new(Collection::new(values)));
                            rs.state = SubState::Collection;
                        }
                    }
                }

                let mut sublist = Vec::new();
                for key in pending {
                    if let Some(entry) = rs.subs.get_mut(&key) {
                        if !entry.loaded {
                            entry.loaded = true;
                            sublist.push(Arc::clone(&entry.subscriber));
                        }
                    }
                }
                (canonical, sublist)
            };

            let handle = ResourceHandle {
                esub,
                query: canonical,
            };
            ctx.unlocked(|| {
                for sub in &sublist {
                    sub.loaded(Ok(handle.clone()));
                }
            });
        }
    }
}

/// Detach a subscriber; empty query entries are dropped immediately.
pub(crate) fn remove_subscriber(ctx: &mut WorkCtx<'_>, query: &str, key: usize) {
    let st = ctx.state();
    let canonical = st.canonical_key(query);
    let mut drop_entry = false;
    if let Some(rs) = st.resources.get_mut(&canonical) {
        rs.subs.remove(&key);
        drop_entry = !canonical.is_empty() && rs.subs.is_empty();
    }
    if drop_entry {
        unregister(st, &canonical);
    }
    st.remove_count(1);
}

/// Drop an entry and every link pointing at it.
fn unregister(st: &mut EventSubState, key: &str) {
    if let Some(rs) = st.resources.remove(key) {
        for link in rs.links {
            st.links.remove(&link);
        }
    }
}

/// Route a bus event to every entry under this resource name.
pub(crate) fn dispatch_event(ctx: &mut WorkCtx<'_>, event: ResourceEvent) {
    if event.kind == EventKind::Reaccess {
        // Access may have changed; always forwarded, even while an
        // entry is still loading, and never touches cached state.
        let subs: Vec<Arc<dyn Subscriber>> = ctx
            .state()
            .resources
            .values()
            .flat_map(ResourceSub::snapshot_subs)
            .collect();
        ctx.unlocked(|| {
            for sub in &subs {
                sub.reaccess();
            }
        });
        return;
    }

    let keys: Vec<String> = ctx.state().resources.keys().cloned().collect();
    for key in keys {
        handle_event(ctx, &key, event.clone());
    }
}

/// Apply one event to one entry, then broadcast it.
pub(crate) fn handle_event(ctx: &mut WorkCtx<'_>, key: &str, mut event: ResourceEvent) {
    let resource_name = ctx.esub.resource_name.clone();

    if event.kind == EventKind::Delete {
        let subs = {
            let st = ctx.state();
            let Some(rs) = st.resources.get_mut(key) else {
                return;
            };
            if !rs.is_loaded() || rs.resetting {
                return;
            }
            let subs: Vec<_> = rs.subs.drain().map(|(_, entry)| entry.subscriber).collect();
            let count = subs.len() as u64;
            unregister(st, key);
            st.remove_count(count);
            subs
        };
        info!(resource = %resource_name, "resource deleted");
        counter!("res_cache_events_applied_total", "kind" => "delete").increment(1);
        ctx.unlocked(|| {
            for sub in &subs {
                sub.event(&event);
            }
        });
        return;
    }

    let subs = {
        let cache = Arc::clone(&ctx.cache);
        let st = ctx.state();
        let Some(rs) = st.resources.get_mut(key) else {
            return;
        };
        if !rs.is_loaded() {
            // The resource is still loading (or errored); nothing to
            // apply the event against.
            return;
        }
        let kind = event.kind.clone();
        let applied = match kind {
            EventKind::Change => {
                !rs.resetting && apply_change(rs, &mut event, &resource_name, &cache)
            }
            EventKind::Add => !rs.resetting && apply_add(rs, &mut event, &resource_name),
            EventKind::Remove => !rs.resetting && apply_remove(rs, &mut event, &resource_name),
            // Service-defined events pass through untouched.
            EventKind::Custom(_) => true,
            EventKind::Delete | EventKind::Reaccess => false,
        };
        if !applied {
            return;
        }
        rs.snapshot_subs()
    };

    counter!("res_cache_events_applied_total", "kind" => event.kind.as_str().to_string())
        .increment(1);
    ctx.unlocked(|| {
        for sub in &subs {
            sub.event(&event);
        }
    });
}

fn apply_change(
    rs: &mut ResourceSub,
    event: &mut ResourceEvent,
    resource_name: &str,
    cache: &CacheShared,
) -> bool {
    if rs.state == SubState::Collection {
        error!(resource = %resource_name, "change event on collection dropped");
        return false;
    }

    let decoded = if res_protocol::is_legacy_change_event(&event.payload) {
        cache.deprecated_once(resource_name);
        decode_legacy_change_event(&event.payload)
    } else {
        decode_change_event(&event.payload)
    };
    let mut props = match decoded {
        Ok(props) => props,
        Err(err) => {
            error!(resource = %resource_name, error = %err, "malformed change event dropped");
            return false;
        }
    };
    let Some(model) = rs.model.clone() else {
        error!(resource = %resource_name, "change event without cached model dropped");
        return false;
    };

    // Clone, then collapse: delete sentinels for absent keys and
    // values equal to the current ones fall out of the record.
    let mut next = model.values().clone();
    props.retain(|key, value| match &*value {
        Value::Delete => next.remove(key).is_some(),
        current => {
            if next.get(key) == Some(current) {
                false
            } else {
                next.insert(key.clone(), current.clone());
                true
            }
        }
    });

    if props.is_empty() {
        return false;
    }

    event.old_values = Some(model);
    event.changed = Some(props);
    rs.model = Some(Arc::new(Model::new(next)));
    true
}

fn apply_add(rs: &mut ResourceSub, event: &mut ResourceEvent, resource_name: &str) -> bool {
    if rs.state == SubState::Model {
        error!(resource = %resource_name, "add event on model dropped");
        return false;
    }
    let params = match decode_add_event(&event.payload) {
        Ok(params) => params,
        Err(err) => {
            error!(resource = %resource_name, error = %err, "malformed add event dropped");
            return false;
        }
    };
    let Some(collection) = rs.collection.clone() else {
        error!(resource = %resource_name, "add event without cached collection dropped");
        return false;
    };

    let old = collection.values();
    let len = old.len();
    if params.idx < 0 || params.idx as usize > len {
        error!(
            resource = %resource_name,
            idx = params.idx,
            "add index out of bounds, event dropped"
        );
        return false;
    }
    let idx = params.idx as usize;

    // The old slice may be aliased by subscribers; build a new one.
    let mut next = Vec::with_capacity(len + 1);
    next.extend_from_slice(&old[..idx]);
    next.push(params.value.clone());
    next.extend_from_slice(&old[idx..]);

    rs.collection = Some(Arc::new(Collection::new(next)));
    event.idx = Some(idx);
    event.value = Some(params.value);
    true
}

fn apply_remove(rs: &mut ResourceSub, event: &mut ResourceEvent, resource_name: &str) -> bool {
    if rs.state == SubState::Model {
        error!(resource = %resource_name, "remove event on model dropped");
        return false;
    }
    let params = match decode_remove_event(&event.payload) {
        Ok(params) => params,
        Err(err) => {
            error!(resource = %resource_name, error = %err, "malformed remove event dropped");
            return false;
        }
    };
    let Some(collection) = rs.collection.clone() else {
        error!(resource = %resource_name, "remove event without cached collection dropped");
        return false;
    };

    let old = collection.values();
    let len = old.len();
    if params.idx < 0 || params.idx as usize >= len {
        error!(
            resource = %resource_name,
            idx = params.idx,
            "remove index out of bounds, event dropped"
        );
        return false;
    }
    let idx = params.idx as usize;

    event.value = Some(old[idx].clone());
    let mut next = Vec::with_capacity(len - 1);
    next.extend_from_slice(&old[..idx]);
    next.extend_from_slice(&old[idx + 1..]);

    rs.collection = Some(Arc::new(Collection::new(next)));
    event.idx = Some(idx);
    true
}

/// Resynchronize every entry under this name after a reconnect.
pub(crate) fn reset_all_resources(ctx: &mut WorkCtx<'_>) {
    let keys: Vec<String> = ctx.state().resources.keys().cloned().collect();
    for key in keys {
        handle_reset_resource(ctx, &key);
    }
}

/// Re-fetch one entry's state and converge the cache onto the reply.
pub(crate) fn handle_reset_resource(ctx: &mut WorkCtx<'_>, key: &str) {
    let query = {
        let st = ctx.state();
        let Some(rs) = st.resources.get_mut(key) else {
            return;
        };
        if rs.resetting {
            return;
        }
        rs.resetting = true;
        rs.query.clone()
    };

    let esub = Arc::clone(ctx.esub);
    let subject = format!("get.{}", esub.resource_name);
    let payload = create_get_request(&query);
    counter!("res_cache_reset_requests_total").increment(1);
    ctx.cache.mq.send_request(
        &subject,
        payload,
        Box::new(move |reply| {
            esub.enqueue(Box::new(move |ctx| {
                if let Some(rs) = ctx.state().resources.get_mut(&query) {
                    rs.resetting = false;
                }
                process_reset_get_response(ctx, &query, reply);
            }));
        }),
    );
}

fn process_reset_get_response(ctx: &mut WorkCtx<'_>, key: &str, reply: Result<Bytes, BusError>) {
    let resource_name = ctx.esub.resource_name.clone();
    let decoded: Result<GetResult, CacheError> = reply
        .map_err(CacheError::from)
        .and_then(|payload| decode_get_response(&payload).map_err(CacheError::from));

    match decoded {
        Err(err) if err.is_not_found() => {
            info!(resource = %resource_name, "resource gone after reset, synthesizing delete");
            handle_event(ctx, key, ResourceEvent::delete());
        }
        Err(err) => {
            error!(resource = %resource_name, error = %err, "reset get failed");
        }
        Ok(result) => {
            let state = ctx.state().resources.get(key).map(|rs| rs.state);
            match (state, result.payload) {
                (Some(SubState::Model), ResourcePayload::Model(props)) => {
                    process_reset_model(ctx, key, props);
                }
                (Some(SubState::Collection), ResourcePayload::Collection(values)) => {
                    process_reset_collection(ctx, key, values);
                }
                (Some(SubState::Model), ResourcePayload::Collection(_))
                | (Some(SubState::Collection), ResourcePayload::Model(_)) => {
                    error!(
                        resource = %resource_name,
                        "reset reply changed the resource type, ignored"
                    );
                }
                _ => {}
            }
        }
    }
}

/// Converge a cached model onto the reset snapshot: vanished keys map
/// to delete sentinels, unchanged keys fall out, and the rest flows
/// through the ordinary change event path.
fn process_reset_model(ctx: &mut WorkCtx<'_>, key: &str, mut props: HashMap<String, Value>) {
    {
        let st = ctx.state();
        let Some(rs) = st.resources.get(key) else {
            return;
        };
        let Some(model) = rs.model.as_ref() else {
            return;
        };
        let values = model.values();
        for name in values.keys() {
            if !props.contains_key(name) {
                props.insert(name.clone(), Value::Delete);
            }
        }
        props.retain(|name, value| values.get(name) != Some(&*value));
    }
    if props.is_empty() {
        return;
    }
    let event = ResourceEvent::new(EventKind::Change, encode_change_event(&props));
    handle_event(ctx, key, event);
}

/// Converge a cached collection onto the reset snapshot through the
/// diffed add/remove event stream.
fn process_reset_collection(ctx: &mut WorkCtx<'_>, key: &str, values: Vec<Value>) {
    let events = {
        let st = ctx.state();
        let Some(rs) = st.resources.get(key) else {
            return;
        };
        let Some(collection) = rs.collection.as_ref() else {
            return;
        };
        diff::diff_events(collection.values(), &values)
    };
    for event in events {
        handle_event(ctx, key, event);
    }
}

/// Ask every subscriber under this name to re-check authorization.
pub(crate) fn reset_all_access(ctx: &mut WorkCtx<'_>) {
    let subs: Vec<Arc<dyn Subscriber>> = ctx
        .state()
        .resources
        .values()
        .flat_map(ResourceSub::snapshot_subs)
        .collect();
    ctx.unlocked(|| {
        for sub in &subs {
            sub.reaccess();
        }
    });
}
