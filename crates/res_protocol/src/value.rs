//! RES value types.
//!
//! A value is a tagged scalar used as a model property or a collection
//! element. Values are immutable after construction and compare
//! structurally.

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A single RES value.
///
/// Wire forms:
/// - primitives (number, string, bool, null) are encoded bare
/// - `{"rid": "..."}` is a resource reference
/// - `{"rid": "...", "soft": true}` is a soft resource reference
/// - `{"data": ...}` wraps opaque JSON of any shape
/// - `{"action": "delete"}` is the delete sentinel, legal only inside
///   change event properties
///
/// Bare objects and arrays are not valid values; nested structure must
/// go through a reference or a data wrapper.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Number, string, bool or null.
    Primitive(serde_json::Value),
    /// Reference to another resource.
    Resource { rid: String },
    /// Soft reference: a link the gateway does not follow.
    SoftResource { rid: String },
    /// Opaque JSON payload.
    Data(serde_json::Value),
    /// Delete sentinel.
    Delete,
}

impl Value {
    /// Build a primitive value from anything JSON-convertible.
    pub fn primitive(v: impl Into<serde_json::Value>) -> Self {
        Value::Primitive(v.into())
    }

    /// Whether this value is the delete sentinel.
    pub fn is_delete(&self) -> bool {
        matches!(self, Value::Delete)
    }

    fn from_wire(raw: serde_json::Value) -> Result<Self, String> {
        match raw {
            serde_json::Value::Object(map) => Self::from_wire_object(map),
            serde_json::Value::Array(_) => {
                Err("array values must be wrapped in a data object".to_string())
            }
            v => Ok(Value::Primitive(v)),
        }
    }

    fn from_wire_object(
        mut map: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, String> {
        if let Some(rid) = map.remove("rid") {
            let rid = match rid {
                serde_json::Value::String(s) => s,
                _ => return Err("rid must be a string".to_string()),
            };
            let soft = match map.remove("soft") {
                None => false,
                Some(serde_json::Value::Bool(b)) => b,
                Some(_) => return Err("soft must be a bool".to_string()),
            };
            if !map.is_empty() {
                return Err("unexpected keys in resource reference".to_string());
            }
            return Ok(if soft {
                Value::SoftResource { rid }
            } else {
                Value::Resource { rid }
            });
        }
        if let Some(data) = map.remove("data") {
            if !map.is_empty() {
                return Err("unexpected keys in data value".to_string());
            }
            return Ok(Value::Data(data));
        }
        if let Some(action) = map.remove("action") {
            if action != "delete" || !map.is_empty() {
                return Err("unknown action value".to_string());
            }
            return Ok(Value::Delete);
        }
        Err("objects must be a resource reference, data value or action".to_string())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Primitive(v) => v.serialize(serializer),
            Value::Resource { rid } => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("rid", rid)?;
                map.end()
            }
            Value::SoftResource { rid } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("rid", rid)?;
                map.serialize_entry("soft", &true)?;
                map.end()
            }
            Value::Data(v) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("data", v)?;
                map.end()
            }
            Value::Delete => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("action", "delete")?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Value::from_wire(raw).map_err(D::Error::custom)
    }
}
