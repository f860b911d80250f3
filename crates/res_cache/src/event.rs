//! Resource event envelopes.

use crate::model::Model;
use bytes::Bytes;
use res_protocol::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Kind of a resource event, parsed from the bus subject suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Change,
    Add,
    Remove,
    Delete,
    Reaccess,
    /// Service-defined event, forwarded to subscribers untouched.
    Custom(String),
}

impl EventKind {
    pub(crate) fn parse(kind: &str) -> Self {
        match kind {
            "change" => EventKind::Change,
            "add" => EventKind::Add,
            "remove" => EventKind::Remove,
            "delete" => EventKind::Delete,
            "reaccess" => EventKind::Reaccess,
            other => EventKind::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Change => "change",
            EventKind::Add => "add",
            EventKind::Remove => "remove",
            EventKind::Delete => "delete",
            EventKind::Reaccess => "reaccess",
            EventKind::Custom(kind) => kind,
        }
    }
}

/// An event applied to a cached resource and forwarded to subscribers.
///
/// The cache applies the event before broadcasting it and stamps the
/// fields below, so subscribers never have to decode the payload
/// again.
#[derive(Debug, Clone)]
pub struct ResourceEvent {
    pub kind: EventKind,
    /// Encoded wire payload as delivered on the bus.
    pub payload: Bytes,
    /// Change events: the properties that actually changed.
    pub changed: Option<HashMap<String, Value>>,
    /// Change events: the model revision the change was applied to.
    pub old_values: Option<Arc<Model>>,
    /// Add and remove events: the affected index.
    pub idx: Option<usize>,
    /// Add events: the added value. Remove events: the removed value.
    pub value: Option<Value>,
}

impl ResourceEvent {
    pub(crate) fn new(kind: EventKind, payload: Bytes) -> Self {
        Self {
            kind,
            payload,
            changed: None,
            old_values: None,
            idx: None,
            value: None,
        }
    }

    pub(crate) fn delete() -> Self {
        Self::new(EventKind::Delete, Bytes::new())
    }
}
