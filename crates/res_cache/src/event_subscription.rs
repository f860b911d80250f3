//! Per-resource-name serialization point.
//!
//! Each resource name gets one `EventSubscription` owning a FIFO work
//! queue and the mutex guarding every cached state entry under that
//! name. Work items — get replies, bus events, unsubscribes — run one
//! at a time in submission order on a drain worker that holds the
//! mutex while executing, releasing it only around subscriber
//! callbacks.

use crate::cache::CacheShared;
use crate::resource::ResourceSub;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Instant;

pub(crate) type WorkItem = Box<dyn FnOnce(&mut WorkCtx<'_>) + Send>;

/// Coordinator for all cached state under one resource name.
pub struct EventSubscription {
    pub(crate) resource_name: String,
    pub(crate) cache: Weak<CacheShared>,
    pub(crate) state: Mutex<EventSubState>,
    queue: Mutex<WorkQueue>,
}

#[derive(Default)]
struct WorkQueue {
    items: VecDeque<WorkItem>,
    running: bool,
}

/// State guarded by the per-name mutex.
pub(crate) struct EventSubState {
    /// Cached state entries keyed by canonical query; the base
    /// resource is the entry with the empty query.
    pub resources: HashMap<String, ResourceSub>,
    /// Requested query → canonical query, recorded when a get reply
    /// normalizes the query.
    pub links: HashMap<String, String>,
    /// Live subscribers across all entries.
    pub count: u64,
    /// When `count` last dropped to zero; eviction eligibility.
    pub idle_since: Option<Instant>,
}

impl EventSubState {
    /// Resolve a requested query to the canonical entry key.
    pub fn canonical_key(&self, query: &str) -> String {
        self.links
            .get(query)
            .cloned()
            .unwrap_or_else(|| query.to_string())
    }

    /// Look up the entry a requested query resolves to.
    pub fn resolve(&self, query: &str) -> Option<&ResourceSub> {
        match self.links.get(query) {
            Some(canonical) => self.resources.get(canonical),
            None => self.resources.get(query),
        }
    }

    pub fn add_count(&mut self) {
        self.count += 1;
        self.idle_since = None;
    }

    pub fn remove_count(&mut self, n: u64) {
        self.count = self.count.saturating_sub(n);
        if self.count == 0 {
            self.idle_since = Some(Instant::now());
        }
    }
}

impl EventSubscription {
    pub(crate) fn new(resource_name: &str, cache: Weak<CacheShared>) -> Self {
        Self {
            resource_name: resource_name.to_string(),
            cache,
            state: Mutex::new(EventSubState {
                resources: HashMap::new(),
                links: HashMap::new(),
                count: 0,
                idle_since: None,
            }),
            queue: Mutex::new(WorkQueue::default()),
        }
    }

    /// Submit a work item. Items run in submission order, one at a
    /// time; an item enqueued from inside another item runs after
    /// everything already queued.
    pub(crate) fn enqueue(self: &Arc<Self>, item: WorkItem) {
        let mut queue = self.queue.lock();
        queue.items.push_back(item);
        if !queue.running {
            queue.running = true;
            let esub = Arc::clone(self);
            std::thread::spawn(move || esub.drain());
        }
    }

    fn drain(self: Arc<Self>) {
        loop {
            let item = {
                let mut queue = self.queue.lock();
                match queue.items.pop_front() {
                    Some(item) => item,
                    None => {
                        queue.running = false;
                        return;
                    }
                }
            };
            // A dropped cache means shutdown; queued items are drained
            // without running so waiters are not left hanging.
            let Some(cache) = self.cache.upgrade() else {
                continue;
            };
            let guard = self.state.lock();
            let mut ctx = WorkCtx {
                esub: &self,
                cache,
                guard: Some(guard),
            };
            item(&mut ctx);
        }
    }

    /// Block until the queue is empty and no item is running.
    pub(crate) fn wait_idle(&self) {
        loop {
            {
                let queue = self.queue.lock();
                if queue.items.is_empty() && !queue.running {
                    return;
                }
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }
}

/// Execution context handed to each work item: the coordination lock,
/// plus the handles an item needs to enqueue follow-up work or reach
/// the bus.
pub(crate) struct WorkCtx<'a> {
    pub esub: &'a Arc<EventSubscription>,
    pub cache: Arc<CacheShared>,
    guard: Option<MutexGuard<'a, EventSubState>>,
}

impl WorkCtx<'_> {
    pub fn state(&mut self) -> &mut EventSubState {
        self.guard.as_mut().expect("state lock held within work item")
    }

    /// Release the coordination lock around subscriber callbacks and
    /// reacquire it afterwards. State read before this call must be
    /// re-verified after it.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.guard = None;
        let result = f();
        self.guard = Some(self.esub.state.lock());
        result
    }
}
