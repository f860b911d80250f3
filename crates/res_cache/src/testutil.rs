//! Test doubles: an in-process bus and a recording subscriber.

use crate::error::CacheError;
use crate::event::ResourceEvent;
use crate::handle::ResourceHandle;
use crate::traits::Subscriber;
use bytes::Bytes;
use nats_client::{
    BusClient, BusError, BusSubscription, EventHandler, ReconnectHandler, ReplyCallback,
};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) const WAIT: Duration = Duration::from_secs(2);

/// In-process bus: records requests for the test to reply to, and
/// routes published events to registered subscription handlers.
#[derive(Default)]
pub(crate) struct MockBus {
    state: Mutex<MockBusState>,
    cv: Condvar,
}

#[derive(Default)]
struct MockBusState {
    requests: Vec<MockRequest>,
    subscriptions: Vec<(String, EventHandler)>,
    reconnect: Vec<ReconnectHandler>,
}

struct MockRequest {
    subject: String,
    payload: Bytes,
    reply: Option<ReplyCallback>,
}

struct MockSubscription;

impl BusSubscription for MockSubscription {}

impl BusClient for MockBus {
    fn send_request(&self, subject: &str, payload: Bytes, callback: ReplyCallback) {
        let mut state = self.state.lock();
        state.requests.push(MockRequest {
            subject: subject.to_string(),
            payload,
            reply: Some(callback),
        });
        self.cv.notify_all();
    }

    fn subscribe(
        &self,
        subject: &str,
        handler: EventHandler,
    ) -> Result<Box<dyn BusSubscription>, BusError> {
        self.state
            .lock()
            .subscriptions
            .push((subject.to_string(), handler));
        Ok(Box::new(MockSubscription))
    }

    fn on_reconnect(&self, handler: ReconnectHandler) {
        self.state.lock().reconnect.push(handler);
    }
}

impl MockBus {
    /// Wait until at least `n` requests have been sent; returns the
    /// actual count.
    pub fn wait_requests(&self, n: usize) -> usize {
        let deadline = Instant::now() + WAIT;
        let mut state = self.state.lock();
        while state.requests.len() < n {
            let timeout = deadline.saturating_duration_since(Instant::now());
            if timeout.is_zero() || self.cv.wait_for(&mut state, timeout).timed_out() {
                break;
            }
        }
        state.requests.len()
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    pub fn request_subject(&self, index: usize) -> String {
        self.state.lock().requests[index].subject.clone()
    }

    pub fn request_payload(&self, index: usize) -> Bytes {
        self.state.lock().requests[index].payload.clone()
    }

    /// Deliver the reply for the index-th request.
    pub fn reply(&self, index: usize, reply: Result<Bytes, BusError>) {
        let callback = self.state.lock().requests[index]
            .reply
            .take()
            .expect("reply already delivered");
        callback(reply);
    }

    pub fn reply_json(&self, index: usize, body: serde_json::Value) {
        self.reply(index, Ok(serde_json::to_vec(&body).unwrap().into()));
    }

    /// Publish an event to every matching subscription handler.
    pub fn publish(&self, subject: &str, body: serde_json::Value) {
        let payload: Bytes = serde_json::to_vec(&body).unwrap().into();
        let handlers: Vec<EventHandler> = self
            .state
            .lock()
            .subscriptions
            .iter()
            .filter(|(pattern, _)| pattern_matches(pattern, subject))
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        assert!(!handlers.is_empty(), "no subscription matches {subject}");
        for handler in handlers {
            handler(subject, payload.clone());
        }
    }

    /// Fire the reconnect signal.
    pub fn reconnect(&self) {
        let handlers = std::mem::take(&mut self.state.lock().reconnect);
        for handler in &handlers {
            handler();
        }
        self.state.lock().reconnect.extend(handlers);
    }
}

fn pattern_matches(pattern: &str, subject: &str) -> bool {
    match pattern.strip_suffix(".>") {
        Some(prefix) => subject
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.')),
        None => pattern == subject,
    }
}

/// Subscriber that records every callback and lets tests wait for
/// them.
#[derive(Default)]
pub(crate) struct RecordingSubscriber {
    state: Mutex<RecordingState>,
    cv: Condvar,
}

#[derive(Default)]
struct RecordingState {
    loaded: Vec<Result<ResourceHandle, CacheError>>,
    events: Vec<ResourceEvent>,
    reaccess: usize,
    log: Vec<String>,
}

impl Subscriber for RecordingSubscriber {
    fn loaded(&self, result: Result<ResourceHandle, CacheError>) {
        let mut state = self.state.lock();
        state.log.push("loaded".to_string());
        state.loaded.push(result);
        self.cv.notify_all();
    }

    fn event(&self, event: &ResourceEvent) {
        let mut state = self.state.lock();
        state.log.push(format!("event:{}", event.kind.as_str()));
        state.events.push(event.clone());
        self.cv.notify_all();
    }

    fn reaccess(&self) {
        let mut state = self.state.lock();
        state.log.push("reaccess".to_string());
        state.reaccess += 1;
        self.cv.notify_all();
    }
}

impl RecordingSubscriber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn wait_until<T>(&self, check: impl Fn(&RecordingState) -> Option<T>) -> T {
        let deadline = Instant::now() + WAIT;
        let mut state = self.state.lock();
        loop {
            if let Some(out) = check(&state) {
                return out;
            }
            let timeout = deadline.saturating_duration_since(Instant::now());
            assert!(!timeout.is_zero(), "timed out waiting on subscriber");
            let _ = self.cv.wait_for(&mut state, timeout);
        }
    }

    /// Wait for the first `loaded` call.
    pub fn wait_loaded(&self) -> Result<ResourceHandle, CacheError> {
        self.wait_until(|state| state.loaded.first().cloned())
    }

    /// Wait until at least `n` events have arrived.
    pub fn wait_events(&self, n: usize) -> Vec<ResourceEvent> {
        self.wait_until(|state| (state.events.len() >= n).then(|| state.events.clone()))
    }

    /// Wait until at least `n` reaccess calls have arrived.
    pub fn wait_reaccess(&self, n: usize) {
        self.wait_until(|state| (state.reaccess >= n).then_some(()))
    }

    pub fn loaded_count(&self) -> usize {
        self.state.lock().loaded.len()
    }

    pub fn event_count(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }
}
