//! Relay core: connection registry, protocol handler and delivery clock.

pub mod clock;
pub mod handler;
pub mod registry;

pub use handler::{ConnectionContext, RelayEvent, RelayHandler};
pub use registry::ConnectionRegistry;
