//! JSON text framing for relay events.
//!
//! Wire format: one event per WebSocket text frame,
//! `{"event": "<name>", "data": <payload>}`.

use crate::error::{RelayError, RelayResult};

/// Encode a serializable event into a JSON text frame.
pub fn encode_event<T: serde::Serialize>(value: &T) -> RelayResult<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a JSON text frame into a typed event.
///
/// Decode failures are reported as [`RelayError::InvalidMessage`] so callers
/// can answer the peer instead of dropping the connection.
pub fn decode_event<T: serde::de::DeserializeOwned>(text: &str) -> RelayResult<T> {
    serde_json::from_str(text).map_err(|e| RelayError::InvalidMessage(e.to_string()))
}
