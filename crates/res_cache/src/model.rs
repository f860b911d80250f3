//! Cached resource state containers.
//!
//! Models and collections are replaced, never mutated in place: a
//! subscriber that has been handed a container may keep reading it
//! while the cache moves on to newer revisions. The serialized form is
//! memoized on first read; replacement is what invalidates it.

use bytes::Bytes;
use res_protocol::{ProtocolError, Value};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::sync::OnceLock;

/// A cached model: a key-unique map from property name to value.
#[derive(Debug, Default)]
pub struct Model {
    values: HashMap<String, Value>,
    encoded: OnceLock<Bytes>,
}

impl Model {
    pub fn new(values: HashMap<String, Value>) -> Self {
        Self {
            values,
            encoded: OnceLock::new(),
        }
    }

    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The JSON encoding of the model, memoized on first call.
    pub fn encoded(&self) -> Result<Bytes, ProtocolError> {
        if let Some(data) = self.encoded.get() {
            return Ok(data.clone());
        }
        let data: Bytes = serde_json::to_vec(&self.values)?.into();
        Ok(self.encoded.get_or_init(|| data).clone())
    }
}

impl PartialEq for Model {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl Serialize for Model {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.values.serialize(serializer)
    }
}

/// A cached collection: an ordered sequence of values.
#[derive(Debug, Default)]
pub struct Collection {
    values: Vec<Value>,
    encoded: OnceLock<Bytes>,
}

impl Collection {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values,
            encoded: OnceLock::new(),
        }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The JSON encoding of the collection, memoized on first call.
    pub fn encoded(&self) -> Result<Bytes, ProtocolError> {
        if let Some(data) = self.encoded.get() {
            return Ok(data.clone());
        }
        let data: Bytes = serde_json::to_vec(&self.values)?.into();
        Ok(self.encoded.get_or_init(|| data).clone())
    }
}

impl PartialEq for Collection {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl Serialize for Collection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.values.serialize(serializer)
    }
}
