//! picrelay-core: shared protocol library for the picture relay.
//!
//! Provides the relay event types exchanged over a connection, the JSON text
//! codec used on the wire, and the common error type.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode_event, encode_event};
pub use error::{RelayError, RelayResult};
pub use messages::{AssetReference, ClientEvent, Delivery, ServerEvent, ANONYMOUS_SENDER};
