//! Relay events exchanged over a client connection.
//!
//! Every frame is a JSON object `{"event": <name>, "data": <payload>}`.
//! Inbound event names from older clients (`shareImage`, `broadcastImage`,
//! `recipientId`, `imageData`) are accepted as aliases.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sender label used when the originating connection never registered.
pub const ANONYMOUS_SENDER: &str = "Anonymous";

/// Reason reported to the sender when a direct share has no live recipient.
pub const RECIPIENT_NOT_FOUND: &str = "Recipient not found or offline";

// ── Inbound ───────────────────────────────────────────────────────────

/// Events a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Claim an identifier for this connection.
    Register(String),
    /// Deliver an asset reference to one named peer.
    #[serde(alias = "shareImage")]
    SendToPeer(SendToPeerPayload),
    /// Deliver an asset reference to every other connection.
    #[serde(alias = "broadcastImage")]
    Broadcast(AssetReference),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendToPeerPayload {
    #[serde(alias = "recipientId")]
    pub recipient_identifier: String,
    #[serde(alias = "imageData")]
    pub asset_reference: AssetReference,
}

/// Opaque descriptor of an uploaded asset. Forwarded verbatim, never inspected.
///
/// Field values are kept as raw JSON: whatever type the sender used is what
/// the recipient sees.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Value>,
}

impl AssetReference {
    pub fn new(image_url: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            image_url: Some(Value::String(image_url.into())),
            filename: Some(Value::String(filename.into())),
            size: None,
        }
    }
}

// ── Outbound ──────────────────────────────────────────────────────────

/// Events the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    Registered(RegisteredPayload),
    ReceiveImage(Delivery),
    ShareSent(ShareSentPayload),
    ShareError(ShareErrorPayload),
    Error(ErrorPayload),
    Shutdown(ShutdownPayload),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredPayload {
    pub identifier: String,
    pub connection_handle: u64,
}

/// Delivery envelope carried by `receiveImage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub sender_identifier: String,
    #[serde(flatten)]
    pub asset: AssetReference,
    /// RFC 3339 UTC, assigned by the relay at send time.
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareSentPayload {
    pub recipient_identifier: String,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareErrorPayload {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownPayload {
    pub reason: String,
}

impl ServerEvent {
    /// Wire name of the event, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Registered(_) => "registered",
            ServerEvent::ReceiveImage(_) => "receiveImage",
            ServerEvent::ShareSent(_) => "shareSent",
            ServerEvent::ShareError(_) => "shareError",
            ServerEvent::Error(_) => "error",
            ServerEvent::Shutdown(_) => "shutdown",
        }
    }
}
