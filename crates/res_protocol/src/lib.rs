//! RES protocol value types and wire codecs.
//!
//! This crate knows the shapes that cross the messaging bus: values
//! with their tagged wire forms, get requests and replies, and the
//! change/add/remove event payloads, including the legacy change shape
//! kept for compatibility with older services.

pub mod codec;
pub mod error;
pub mod value;

pub use codec::{
    create_get_request, decode_add_event, decode_change_event, decode_get_response,
    decode_legacy_change_event, decode_remove_event, encode_add_event, encode_change_event,
    encode_remove_event, is_legacy_change_event, AddEvent, GetResult, RemoveEvent,
    ResourcePayload,
};
pub use error::{codes, GetError, ProtocolError, ResError};
pub use value::Value;
