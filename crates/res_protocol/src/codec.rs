//! Wire codecs for get requests/replies and resource events.
//!
//! Replies arrive as `{"result": {...}}` or `{"error": {...}}`.
//! Event payload shapes:
//! - change: `{"values": {key: value, ...}}` (the legacy form is the
//!   bare property map)
//! - add: `{"idx": n, "value": v}`
//! - remove: `{"idx": n}`

use crate::error::{GetError, ProtocolError, ResError};
use crate::value::Value;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The state payload of a successful get reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourcePayload {
    Model(HashMap<String, Value>),
    Collection(Vec<Value>),
}

/// A decoded get reply.
#[derive(Debug, Clone, PartialEq)]
pub struct GetResult {
    pub payload: ResourcePayload,
    /// Normalized query, empty when the service did not report one.
    pub query: String,
}

#[derive(Deserialize)]
struct GetReply {
    result: Option<GetReplyResult>,
    error: Option<ResError>,
}

#[derive(Deserialize)]
struct GetReplyResult {
    model: Option<HashMap<String, Value>>,
    collection: Option<Vec<Value>>,
    #[serde(default)]
    query: String,
}

/// Decode a get reply into a model or collection payload plus the
/// normalized query.
pub fn decode_get_response(payload: &[u8]) -> Result<GetResult, GetError> {
    let reply: GetReply = serde_json::from_slice(payload).map_err(ProtocolError::from)?;
    if let Some(err) = reply.error {
        return Err(GetError::Resource(err));
    }
    let result = reply
        .result
        .ok_or_else(|| ProtocolError::Invalid("reply carries neither result nor error".into()))?;

    let payload = match (result.model, result.collection) {
        (Some(model), None) => {
            if model.values().any(Value::is_delete) {
                return Err(ProtocolError::UnexpectedDelete.into());
            }
            ResourcePayload::Model(model)
        }
        (None, Some(collection)) => {
            if collection.iter().any(Value::is_delete) {
                return Err(ProtocolError::UnexpectedDelete.into());
            }
            ResourcePayload::Collection(collection)
        }
        _ => {
            return Err(ProtocolError::Invalid(
                "result must carry exactly one of model or collection".into(),
            )
            .into())
        }
    };

    Ok(GetResult {
        payload,
        query: result.query,
    })
}

/// Build the body of an outbound get request.
pub fn create_get_request(query: &str) -> Bytes {
    if query.is_empty() {
        return Bytes::new();
    }
    encode(&serde_json::json!({ "query": query }))
}

#[derive(Deserialize)]
struct ChangeBody {
    values: HashMap<String, Value>,
}

/// Decode a change event payload into its property map.
pub fn decode_change_event(payload: &[u8]) -> Result<HashMap<String, Value>, ProtocolError> {
    let body: ChangeBody = serde_json::from_slice(payload)?;
    Ok(body.values)
}

/// Whether a change event payload uses the legacy shape: the bare
/// property map without the `values` wrapper.
pub fn is_legacy_change_event(payload: &[u8]) -> bool {
    let Ok(raw) = serde_json::from_slice::<serde_json::Value>(payload) else {
        return false;
    };
    match raw.as_object() {
        Some(map) => !(map.len() == 1 && map.get("values").is_some_and(|v| v.is_object())),
        None => false,
    }
}

/// Decode a legacy change event payload. Produces the same property
/// semantics as [`decode_change_event`].
pub fn decode_legacy_change_event(
    payload: &[u8],
) -> Result<HashMap<String, Value>, ProtocolError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Encode a change event payload.
pub fn encode_change_event(props: &HashMap<String, Value>) -> Bytes {
    #[derive(Serialize)]
    struct Body<'a> {
        values: &'a HashMap<String, Value>,
    }
    encode(&Body { values: props })
}

/// Parameters of an add event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AddEvent {
    pub idx: i64,
    pub value: Value,
}

/// Decode an add event payload.
pub fn decode_add_event(payload: &[u8]) -> Result<AddEvent, ProtocolError> {
    let event: AddEvent = serde_json::from_slice(payload)?;
    if event.value.is_delete() {
        return Err(ProtocolError::UnexpectedDelete);
    }
    Ok(event)
}

/// Encode an add event payload.
pub fn encode_add_event(idx: i64, value: &Value) -> Bytes {
    #[derive(Serialize)]
    struct Body<'a> {
        idx: i64,
        value: &'a Value,
    }
    encode(&Body { idx, value })
}

/// Parameters of a remove event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RemoveEvent {
    pub idx: i64,
}

/// Decode a remove event payload.
pub fn decode_remove_event(payload: &[u8]) -> Result<RemoveEvent, ProtocolError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Encode a remove event payload.
pub fn encode_remove_event(idx: i64) -> Bytes {
    encode(&serde_json::json!({ "idx": idx }))
}

fn encode<T: Serialize>(body: &T) -> Bytes {
    serde_json::to_vec(body)
        .expect("wire value serialization cannot fail")
        .into()
}
