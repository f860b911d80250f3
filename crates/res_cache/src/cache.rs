//! Process-wide resource cache registry.
//!
//! Maps resource names to their coordinators, owns the bus event
//! subscriptions, triggers resynchronization on reconnect, and evicts
//! coordinators that have had no subscribers for the grace period.

use crate::error::CacheError;
use crate::event::{EventKind, ResourceEvent};
use crate::event_subscription::EventSubscription;
use crate::handle::ResourceHandle;
use crate::resource;
use crate::traits::Subscriber;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::counter;
use nats_client::{BusClient, BusSubscription, EventHandler};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cache tuning knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long a resource name with no live subscribers keeps its bus
    /// subscription before being evicted.
    pub unsubscribe_grace: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            unsubscribe_grace: Duration::from_secs(5),
        }
    }
}

/// The resource cache and subscription coordinator.
pub struct Cache {
    shared: Arc<CacheShared>,
    sweeper: Mutex<Option<SweeperHandle>>,
}

pub(crate) struct CacheShared {
    pub mq: Arc<dyn BusClient>,
    pub config: CacheConfig,
    registry: DashMap<String, RegistryEntry>,
    deprecated: Mutex<HashSet<String>>,
}

struct RegistryEntry {
    esub: Arc<EventSubscription>,
    /// Dropping the guard releases the bus subscription.
    _bus: Box<dyn BusSubscription>,
}

struct SweeperHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl Cache {
    pub fn new(mq: Arc<dyn BusClient>, config: CacheConfig) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                mq,
                config,
                registry: DashMap::new(),
                deprecated: Mutex::new(HashSet::new()),
            }),
            sweeper: Mutex::new(None),
        }
    }

    /// Register the reconnect handler and start the eviction sweeper.
    pub fn start(&self) {
        let weak = Arc::downgrade(&self.shared);
        self.shared.mq.on_reconnect(Box::new(move || {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            info!("bus reconnected, resynchronizing cached resources");
            counter!("res_cache_resets_total").increment(1);
            shared.reset_resources();
        }));

        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            let stop = Arc::new(AtomicBool::new(false));
            let stop_flag = Arc::clone(&stop);
            let weak = Arc::downgrade(&self.shared);
            let tick = self
                .shared
                .config
                .unsubscribe_grace
                .min(Duration::from_secs(1))
                .max(Duration::from_millis(10));
            let thread = std::thread::spawn(move || loop {
                std::thread::sleep(tick);
                if stop_flag.load(Ordering::Relaxed) {
                    return;
                }
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                shared.sweep();
            });
            *sweeper = Some(SweeperHandle { stop, thread });
        }
    }

    /// Subscribe to a resource. The subscriber receives `loaded` once
    /// the state is available (or the fetch failed), then events.
    /// Subscribing the same subscriber instance again is a no-op.
    pub fn subscribe(
        &self,
        resource_name: &str,
        query: &str,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<ResourceHandle, CacheError> {
        let esub = match self.shared.registry.entry(resource_name.to_string()) {
            Entry::Occupied(occupied) => {
                let esub = Arc::clone(&occupied.get().esub);
                esub.state.lock().add_count();
                esub
            }
            Entry::Vacant(vacant) => {
                let esub = Arc::new(EventSubscription::new(
                    resource_name,
                    Arc::downgrade(&self.shared),
                ));
                let subject = format!("event.{}.>", resource_name);
                let bus = self
                    .shared
                    .mq
                    .subscribe(&subject, event_handler(&esub))
                    .map_err(|err| CacheError::Bus(err.to_string()))?;
                debug!(resource = %resource_name, "event subscription created");
                counter!("res_cache_event_subscriptions_total").increment(1);
                esub.state.lock().add_count();
                vacant.insert(RegistryEntry {
                    esub: Arc::clone(&esub),
                    _bus: bus,
                });
                esub
            }
        };

        counter!("res_cache_subscriptions_total").increment(1);
        let query_owned = query.to_string();
        esub.enqueue(Box::new(move |ctx| {
            resource::add_subscriber(ctx, query_owned, subscriber);
        }));
        Ok(ResourceHandle {
            esub,
            query: query.to_string(),
        })
    }

    /// Ask every subscriber to re-check authorization without touching
    /// cached state.
    pub fn reset_access(&self) {
        for entry in self.shared.registry.iter() {
            let esub = Arc::clone(&entry.esub);
            esub.enqueue(Box::new(resource::reset_all_access));
        }
    }

    /// Number of resource names currently coordinated.
    pub fn resource_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Release bus subscriptions, stop the sweeper and wait for each
    /// coordinator's in-flight work to drain.
    pub fn stop(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.stop.store(true, Ordering::Relaxed);
            let _ = sweeper.thread.join();
        }
        let esubs: Vec<Arc<EventSubscription>> = self
            .shared
            .registry
            .iter()
            .map(|entry| Arc::clone(&entry.esub))
            .collect();
        self.shared.registry.clear();
        for esub in &esubs {
            esub.wait_idle();
        }
        info!("resource cache stopped");
    }
}

impl CacheShared {
    fn reset_resources(&self) {
        for entry in self.registry.iter() {
            let esub = Arc::clone(&entry.esub);
            esub.enqueue(Box::new(resource::reset_all_resources));
        }
    }

    fn sweep(&self) {
        let grace = self.config.unsubscribe_grace;
        self.registry.retain(|name, entry| {
            let state = entry.esub.state.lock();
            let evict = state.count == 0
                && state
                    .idle_since
                    .is_some_and(|since| since.elapsed() >= grace);
            if evict {
                debug!(resource = %name, "evicting idle event subscription");
            }
            !evict
        });
    }

    /// Log the legacy change-event notice once per resource name.
    pub(crate) fn deprecated_once(&self, resource_name: &str) {
        let mut seen = self.deprecated.lock();
        if seen.insert(resource_name.to_string()) {
            warn!(
                resource = %resource_name,
                "legacy change event payload without a values wrapper; update the service"
            );
        }
    }
}

fn event_handler(esub: &Arc<EventSubscription>) -> EventHandler {
    let weak = Arc::downgrade(esub);
    let prefix_len = "event.".len() + esub.resource_name.len() + 1;
    Arc::new(move |subject: &str, payload: Bytes| {
        let Some(esub) = weak.upgrade() else {
            return;
        };
        let Some(kind) = subject.get(prefix_len..).filter(|kind| !kind.is_empty()) else {
            warn!(subject = %subject, "event without a kind suffix dropped");
            return;
        };
        let event = ResourceEvent::new(EventKind::parse(kind), payload);
        esub.enqueue(Box::new(move |ctx| {
            resource::dispatch_event(ctx, event);
        }));
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::handle::ResourceType;
    use crate::testutil::{MockBus, RecordingSubscriber};
    use nats_client::BusError;
    use res_protocol::Value;
    use serde_json::json;
    use std::time::Instant;

    fn setup() -> (Arc<MockBus>, Cache) {
        let bus = Arc::new(MockBus::default());
        let cache = Cache::new(bus.clone(), CacheConfig::default());
        (bus, cache)
    }

    /// Subscribe and load a model resource in one step.
    fn load_model(
        bus: &MockBus,
        cache: &Cache,
        name: &str,
        model: serde_json::Value,
    ) -> (Arc<RecordingSubscriber>, ResourceHandle) {
        let rec = RecordingSubscriber::new();
        let handle = cache.subscribe(name, "", rec.clone()).unwrap();
        let request = bus.wait_requests(1) - 1;
        bus.reply_json(request, json!({"result": {"model": model}}));
        rec.wait_loaded().unwrap();
        (rec, handle)
    }

    fn load_collection(
        bus: &MockBus,
        cache: &Cache,
        name: &str,
        collection: serde_json::Value,
    ) -> (Arc<RecordingSubscriber>, ResourceHandle) {
        let rec = RecordingSubscriber::new();
        let handle = cache.subscribe(name, "", rec.clone()).unwrap();
        let request = bus.wait_requests(1) - 1;
        bus.reply_json(request, json!({"result": {"collection": collection}}));
        rec.wait_loaded().unwrap();
        (rec, handle)
    }

    #[test]
    fn test_subscribe_loads_model() {
        let (bus, cache) = setup();
        let rec = RecordingSubscriber::new();
        let handle = cache.subscribe("svc.item", "", rec.clone()).unwrap();

        assert_eq!(bus.wait_requests(1), 1);
        assert_eq!(bus.request_subject(0), "get.svc.item");
        assert!(bus.request_payload(0).is_empty());

        bus.reply_json(0, json!({"result": {"model": {"a": 1, "b": 2}}}));
        let loaded = rec.wait_loaded().unwrap();
        assert_eq!(loaded.resource_name(), "svc.item");
        assert_eq!(handle.resource_type(), Some(ResourceType::Model));

        let access = handle.access();
        let model = access.model().unwrap();
        assert_eq!(model.get("a"), Some(&Value::primitive(1)));
        assert_eq!(model.get("b"), Some(&Value::primitive(2)));
    }

    #[test]
    fn test_query_subscription_sends_query_payload() {
        let (bus, cache) = setup();
        let rec = RecordingSubscriber::new();
        cache.subscribe("svc.items", "limit=10", rec.clone()).unwrap();
        assert_eq!(bus.wait_requests(1), 1);
        let body: serde_json::Value =
            serde_json::from_slice(&bus.request_payload(0)).unwrap();
        assert_eq!(body, json!({"query": "limit=10"}));
    }

    #[test]
    fn test_concurrent_subscribers_share_one_get() {
        let (bus, cache) = setup();
        let rec1 = RecordingSubscriber::new();
        let rec2 = RecordingSubscriber::new();
        cache.subscribe("svc.item", "", rec1.clone()).unwrap();
        cache.subscribe("svc.item", "", rec2.clone()).unwrap();

        assert_eq!(bus.wait_requests(1), 1);
        bus.reply_json(0, json!({"result": {"model": {"a": 1}}}));

        rec1.wait_loaded().unwrap();
        rec2.wait_loaded().unwrap();
        assert_eq!(bus.request_count(), 1);
    }

    #[test]
    fn test_resubscribing_same_instance_is_noop() {
        let (bus, cache) = setup();
        let rec = RecordingSubscriber::new();
        cache.subscribe("svc.item", "", rec.clone()).unwrap();
        cache.subscribe("svc.item", "", rec.clone()).unwrap();

        bus.wait_requests(1);
        bus.reply_json(0, json!({"result": {"model": {"a": 1}}}));
        rec.wait_loaded().unwrap();

        bus.publish("event.svc.item.change", json!({"values": {"a": 2}}));
        rec.wait_events(1);
        assert_eq!(rec.loaded_count(), 1);
    }

    #[test]
    fn test_change_event_collapses_to_actual_changes() {
        let (bus, cache) = setup();
        let (rec, handle) = load_model(&bus, &cache, "svc.item", json!({"a": 1, "b": 2}));

        bus.publish("event.svc.item.change", json!({"values": {"a": 1, "c": 3}}));

        let events = rec.wait_events(1);
        let event = &events[0];
        assert_eq!(event.kind, EventKind::Change);
        let changed = event.changed.as_ref().unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed.get("c"), Some(&Value::primitive(3)));
        let old = event.old_values.as_ref().unwrap();
        assert_eq!(old.get("b"), Some(&Value::primitive(2)));
        assert!(old.get("c").is_none());

        let access = handle.access();
        let model = access.model().unwrap();
        assert_eq!(model.len(), 3);
        assert_eq!(model.get("c"), Some(&Value::primitive(3)));
    }

    #[test]
    fn test_noop_changes_are_not_forwarded() {
        let (bus, cache) = setup();
        let (rec, _handle) = load_model(&bus, &cache, "svc.item", json!({"a": 1}));

        // Equal value and delete-of-missing both collapse to nothing.
        bus.publish("event.svc.item.change", json!({"values": {"a": 1}}));
        bus.publish(
            "event.svc.item.change",
            json!({"values": {"x": {"action": "delete"}}}),
        );
        // Marker event; queue order guarantees the dropped events
        // would have arrived first.
        bus.publish("event.svc.item.change", json!({"values": {"b": 2}}));

        let events = rec.wait_events(1);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].changed.as_ref().unwrap().get("b"),
            Some(&Value::primitive(2))
        );
    }

    #[test]
    fn test_legacy_change_event_is_applied() {
        let (bus, cache) = setup();
        let (rec, handle) = load_model(&bus, &cache, "svc.item", json!({"a": 1}));

        bus.publish("event.svc.item.change", json!({"c": 3}));

        let events = rec.wait_events(1);
        assert_eq!(
            events[0].changed.as_ref().unwrap().get("c"),
            Some(&Value::primitive(3))
        );
        let access = handle.access();
        assert_eq!(access.model().unwrap().len(), 2);
    }

    #[test]
    fn test_change_can_delete_present_key() {
        let (bus, cache) = setup();
        let (rec, handle) = load_model(&bus, &cache, "svc.item", json!({"a": 1, "b": 2}));

        bus.publish(
            "event.svc.item.change",
            json!({"values": {"b": {"action": "delete"}}}),
        );

        let events = rec.wait_events(1);
        assert_eq!(
            events[0].changed.as_ref().unwrap().get("b"),
            Some(&Value::Delete)
        );
        let access = handle.access();
        let model = access.model().unwrap();
        assert_eq!(model.len(), 1);
        assert!(model.get("b").is_none());
    }

    #[test]
    fn test_collection_add_remove_and_bounds() {
        let (bus, cache) = setup();
        let (rec, handle) =
            load_collection(&bus, &cache, "svc.items", json!(["x", "y", "z"]));

        // Out of bounds: dropped.
        bus.publish("event.svc.items.add", json!({"idx": 4, "value": "q"}));
        // [x, q, y, z]
        bus.publish("event.svc.items.add", json!({"idx": 1, "value": "q"}));
        // [x, q, y]
        bus.publish("event.svc.items.remove", json!({"idx": 3}));

        let events = rec.wait_events(2);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Add);
        assert_eq!(events[0].idx, Some(1));
        assert_eq!(events[0].value, Some(Value::primitive("q")));
        assert_eq!(events[1].kind, EventKind::Remove);
        assert_eq!(events[1].idx, Some(3));
        assert_eq!(events[1].value, Some(Value::primitive("z")));

        let access = handle.access();
        assert_eq!(
            access.collection().unwrap().values().to_vec(),
            vec![
                Value::primitive("x"),
                Value::primitive("q"),
                Value::primitive("y"),
            ]
        );
    }

    #[test]
    fn test_mistyped_events_are_dropped() {
        let (bus, cache) = setup();
        let (rec, _handle) = load_model(&bus, &cache, "svc.item", json!({"a": 1}));

        bus.publish("event.svc.item.add", json!({"idx": 0, "value": "q"}));
        bus.publish("event.svc.item.remove", json!({"idx": 0}));
        bus.publish("event.svc.item.change", json!({"values": {"b": 2}}));

        let events = rec.wait_events(1);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Change);
    }

    #[test]
    fn test_custom_events_are_forwarded() {
        let (bus, cache) = setup();
        let (rec, _handle) = load_model(&bus, &cache, "svc.item", json!({"a": 1}));

        bus.publish("event.svc.item.activity", json!({"who": "someone"}));

        let events = rec.wait_events(1);
        assert_eq!(events[0].kind, EventKind::Custom("activity".to_string()));
        let body: serde_json::Value = serde_json::from_slice(&events[0].payload).unwrap();
        assert_eq!(body, json!({"who": "someone"}));
    }

    #[test]
    fn test_handed_out_containers_are_immutable() {
        let (bus, cache) = setup();
        let (rec, handle) = load_model(&bus, &cache, "svc.item", json!({"a": 1}));

        let revision = {
            let access = handle.access();
            Arc::clone(access.model().unwrap())
        };

        bus.publish("event.svc.item.change", json!({"values": {"b": 2}}));
        bus.publish("event.svc.item.change", json!({"values": {"a": 9}}));
        rec.wait_events(2);

        assert_eq!(revision.len(), 1);
        assert_eq!(revision.get("a"), Some(&Value::primitive(1)));
        let access = handle.access();
        assert_eq!(access.model().unwrap().get("a"), Some(&Value::primitive(9)));
    }

    #[test]
    fn test_loaded_precedes_events_and_order_is_kept() {
        let (bus, cache) = setup();
        let (rec, handle) = load_collection(&bus, &cache, "svc.items", json!([]));

        bus.publish("event.svc.items.add", json!({"idx": 0, "value": "a"}));
        bus.publish("event.svc.items.add", json!({"idx": 1, "value": "b"}));
        bus.publish("event.svc.items.add", json!({"idx": 0, "value": "c"}));
        rec.wait_events(3);

        let log = rec.log();
        assert_eq!(log[0], "loaded");
        assert_eq!(log.len(), 4);
        assert!(log[1..].iter().all(|entry| entry == "event:add"));
        let access = handle.access();
        assert_eq!(
            access.collection().unwrap().values().to_vec(),
            vec![
                Value::primitive("c"),
                Value::primitive("a"),
                Value::primitive("b"),
            ]
        );
    }

    #[test]
    fn test_query_normalization_links_later_subscribers() {
        let (bus, cache) = setup();
        let rec1 = RecordingSubscriber::new();
        cache
            .subscribe("svc.items", "b=2&a=1", rec1.clone())
            .unwrap();
        bus.wait_requests(1);
        bus.reply_json(
            0,
            json!({"result": {"collection": ["x"], "query": "a=1&b=2"}}),
        );
        let handle1 = rec1.wait_loaded().unwrap();
        assert_eq!(handle1.query(), "a=1&b=2");

        // The canonical query and the original one both resolve to the
        // cached entry without another get.
        let rec2 = RecordingSubscriber::new();
        let handle2 = cache
            .subscribe("svc.items", "a=1&b=2", rec2.clone())
            .unwrap();
        rec2.wait_loaded().unwrap();

        let rec3 = RecordingSubscriber::new();
        let handle3 = cache
            .subscribe("svc.items", "b=2&a=1", rec3.clone())
            .unwrap();
        rec3.wait_loaded().unwrap();

        assert_eq!(bus.request_count(), 1);
        for handle in [&handle2, &handle3] {
            let access = handle.access();
            assert_eq!(
                access.collection().unwrap().values().to_vec(),
                vec![Value::primitive("x")]
            );
        }
    }

    #[test]
    fn test_concurrent_normalization_loads_each_subscriber_once() {
        let (bus, cache) = setup();
        let rec1 = RecordingSubscriber::new();
        let rec2 = RecordingSubscriber::new();
        cache
            .subscribe("svc.items", "b=2&a=1", rec1.clone())
            .unwrap();
        cache
            .subscribe("svc.items", "a=1&b=2", rec2.clone())
            .unwrap();
        assert_eq!(bus.wait_requests(2), 2);

        // The first reply normalizes onto the second entry, which is
        // still waiting for its own reply.
        bus.reply_json(
            0,
            json!({"result": {"collection": ["x"], "query": "a=1&b=2"}}),
        );
        let handle1 = rec1.wait_loaded().unwrap();
        bus.reply_json(
            1,
            json!({"result": {"collection": ["x"], "query": "a=1&b=2"}}),
        );
        let handle2 = rec2.wait_loaded().unwrap();

        assert_eq!(handle1.query(), "a=1&b=2");
        assert_eq!(handle2.query(), "a=1&b=2");

        // Settle the queue with a marker event, then check there were
        // no duplicate loaded calls.
        bus.publish("event.svc.items.add", json!({"idx": 0, "value": "y"}));
        rec1.wait_events(1);
        rec2.wait_events(1);
        assert_eq!(rec1.loaded_count(), 1);
        assert_eq!(rec2.loaded_count(), 1);
    }

    #[test]
    fn test_failed_get_reports_error_and_drops_entry() {
        let (bus, cache) = setup();
        let rec = RecordingSubscriber::new();
        let handle = cache.subscribe("svc.item", "", rec.clone()).unwrap();
        bus.wait_requests(1);
        bus.reply_json(
            0,
            json!({"error": {"code": "system.notFound", "message": "Not found"}}),
        );

        let err = rec.wait_loaded().unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(handle.resource_type(), None);

        // The entry is gone; a new subscriber triggers a fresh get.
        let rec2 = RecordingSubscriber::new();
        cache.subscribe("svc.item", "", rec2.clone()).unwrap();
        assert_eq!(bus.wait_requests(2), 2);
    }

    #[test]
    fn test_request_timeout_surfaces_to_subscribers() {
        let (bus, cache) = setup();
        let rec = RecordingSubscriber::new();
        cache.subscribe("svc.item", "", rec.clone()).unwrap();
        bus.wait_requests(1);
        bus.reply(0, Err(BusError::Timeout));

        assert_eq!(rec.wait_loaded().unwrap_err(), CacheError::Timeout);
    }

    #[test]
    fn test_unsubscribed_before_reply_is_not_loaded() {
        let (bus, cache) = setup();
        let rec = RecordingSubscriber::new();
        let handle = cache.subscribe("svc.items", "q=1", rec.clone()).unwrap();
        bus.wait_requests(1);
        handle.unsubscribe(&(rec.clone() as Arc<dyn Subscriber>));

        // The reply finds the query entry already dropped.
        bus.reply_json(0, json!({"result": {"collection": []}}));

        // A fresh subscription starts over with a new get.
        let rec2 = RecordingSubscriber::new();
        cache.subscribe("svc.items", "q=1", rec2.clone()).unwrap();
        assert_eq!(bus.wait_requests(2), 2);
        bus.reply_json(1, json!({"result": {"collection": []}}));
        rec2.wait_loaded().unwrap();
        assert_eq!(rec.loaded_count(), 0);
    }

    #[test]
    fn test_delete_event_drops_resource() {
        let (bus, cache) = setup();
        let (rec, handle) = load_model(&bus, &cache, "svc.item", json!({"a": 1}));

        bus.publish("event.svc.item.delete", json!({}));

        let events = rec.wait_events(1);
        assert_eq!(events[0].kind, EventKind::Delete);
        assert_eq!(handle.resource_type(), None);

        // A new subscriber starts from scratch.
        let rec2 = RecordingSubscriber::new();
        cache.subscribe("svc.item", "", rec2.clone()).unwrap();
        assert_eq!(bus.wait_requests(2), 2);
    }

    #[test]
    fn test_unsubscribed_subscriber_stops_receiving_events() {
        let (bus, cache) = setup();
        let (rec1, handle) = load_model(&bus, &cache, "svc.item", json!({"a": 1}));
        let rec2 = RecordingSubscriber::new();
        cache.subscribe("svc.item", "", rec2.clone()).unwrap();
        rec2.wait_loaded().unwrap();

        handle.unsubscribe(&(rec1.clone() as Arc<dyn Subscriber>));
        bus.publish("event.svc.item.change", json!({"values": {"a": 2}}));

        rec2.wait_events(1);
        assert_eq!(rec1.event_count(), 0);
    }

    #[test]
    fn test_reaccess_event_reaches_subscribers() {
        let (bus, cache) = setup();
        let (rec, _handle) = load_model(&bus, &cache, "svc.item", json!({"a": 1}));

        bus.publish("event.svc.item.reaccess", json!({}));
        rec.wait_reaccess(1);
        assert_eq!(rec.event_count(), 0);
    }

    #[test]
    fn test_reaccess_is_forwarded_even_before_load() {
        let (bus, cache) = setup();
        let rec = RecordingSubscriber::new();
        cache.subscribe("svc.item", "", rec.clone()).unwrap();
        bus.wait_requests(1);

        bus.publish("event.svc.item.reaccess", json!({}));
        rec.wait_reaccess(1);
        assert_eq!(rec.loaded_count(), 0);
    }

    #[test]
    fn test_reset_access_fans_out() {
        let (bus, cache) = setup();
        let (rec, _handle) = load_model(&bus, &cache, "svc.item", json!({"a": 1}));
        cache.reset_access();
        rec.wait_reaccess(1);
    }

    #[test]
    fn test_reconnect_reset_converges_model() {
        let (bus, cache) = setup();
        cache.start();
        let (rec, handle) = load_model(&bus, &cache, "svc.item", json!({"a": 1, "b": 2}));

        bus.reconnect();
        assert_eq!(bus.wait_requests(2), 2);
        assert_eq!(bus.request_subject(1), "get.svc.item");
        bus.reply_json(1, json!({"result": {"model": {"a": 1, "c": 3}}}));

        let events = rec.wait_events(1);
        let changed = events[0].changed.as_ref().unwrap();
        assert_eq!(changed.get("b"), Some(&Value::Delete));
        assert_eq!(changed.get("c"), Some(&Value::primitive(3)));
        assert!(changed.get("a").is_none());

        let access = handle.access();
        let model = access.model().unwrap();
        assert_eq!(model.len(), 2);
        assert_eq!(model.get("c"), Some(&Value::primitive(3)));
        assert!(model.get("b").is_none());
        drop(access);
        cache.stop();
    }

    #[test]
    fn test_reconnect_reset_converges_collection() {
        let (bus, cache) = setup();
        cache.start();
        let (rec, handle) =
            load_collection(&bus, &cache, "svc.items", json!(["A", "B", "C"]));

        bus.reconnect();
        assert_eq!(bus.wait_requests(2), 2);
        bus.reply_json(1, json!({"result": {"collection": ["C", "A", "B"]}}));

        let events = rec.wait_events(2);
        assert_eq!(events[0].kind, EventKind::Remove);
        assert_eq!(events[0].idx, Some(2));
        assert_eq!(events[0].value, Some(Value::primitive("C")));
        assert_eq!(events[1].kind, EventKind::Add);
        assert_eq!(events[1].idx, Some(0));
        assert_eq!(events[1].value, Some(Value::primitive("C")));

        let access = handle.access();
        assert_eq!(
            access.collection().unwrap().values().to_vec(),
            vec![
                Value::primitive("C"),
                Value::primitive("A"),
                Value::primitive("B"),
            ]
        );
        drop(access);
        cache.stop();
    }

    #[test]
    fn test_reset_not_found_synthesizes_delete() {
        let (bus, cache) = setup();
        cache.start();
        let (rec, handle) = load_model(&bus, &cache, "svc.item", json!({"a": 1}));

        bus.reconnect();
        assert_eq!(bus.wait_requests(2), 2);
        bus.reply_json(
            1,
            json!({"error": {"code": "system.notFound", "message": "Not found"}}),
        );

        let events = rec.wait_events(1);
        assert_eq!(events[0].kind, EventKind::Delete);
        assert_eq!(handle.resource_type(), None);

        // A new subscription starts a fresh get.
        let rec2 = RecordingSubscriber::new();
        cache.subscribe("svc.item", "", rec2.clone()).unwrap();
        assert_eq!(bus.wait_requests(3), 3);
        cache.stop();
    }

    #[test]
    fn test_idle_resources_are_evicted_after_grace() {
        let bus = Arc::new(MockBus::default());
        let cache = Cache::new(
            bus.clone(),
            CacheConfig {
                unsubscribe_grace: Duration::from_millis(50),
            },
        );
        cache.start();

        let (rec, handle) = load_model(&bus, &cache, "svc.item", json!({"a": 1}));
        assert_eq!(cache.resource_count(), 1);
        handle.unsubscribe(&(rec.clone() as Arc<dyn Subscriber>));

        let deadline = Instant::now() + crate::testutil::WAIT;
        while cache.resource_count() > 0 {
            assert!(Instant::now() < deadline, "eviction never happened");
            std::thread::sleep(Duration::from_millis(10));
        }

        // A new subscription re-creates the coordinator and refetches.
        let rec2 = RecordingSubscriber::new();
        cache.subscribe("svc.item", "", rec2.clone()).unwrap();
        assert_eq!(bus.wait_requests(2), 2);
        assert_eq!(cache.resource_count(), 1);
        cache.stop();
    }
}
