//! Relay protocol handler: interprets one inbound event at a time for a
//! connection and drives the registry plus outbound delivery.

use super::clock::DeliveryClock;
use super::registry::{ConnectionId, ConnectionRegistry};
use picrelay_core::messages::{
    AssetReference, ClientEvent, Delivery, RegisteredPayload, SendToPeerPayload, ServerEvent,
    ShareErrorPayload, ShareSentPayload, ANONYMOUS_SENDER, RECIPIENT_NOT_FOUND,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Per-connection state, owned by the connection task and threaded through
/// every dispatch.
#[derive(Debug)]
pub struct ConnectionContext {
    /// Handle assigned when the connection was accepted.
    pub conn_id: ConnectionId,
    /// Identifier from the last `register`, if any.
    pub identifier: Option<String>,
}

impl ConnectionContext {
    pub fn new(conn_id: ConnectionId) -> Self {
        Self {
            conn_id,
            identifier: None,
        }
    }

    /// Label used as the sender of deliveries from this connection.
    pub fn sender_label(&self) -> &str {
        self.identifier.as_deref().unwrap_or(ANONYMOUS_SENDER)
    }
}

/// Everything that can happen on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Register { identifier: String },
    SendToPeer {
        recipient_identifier: String,
        asset: AssetReference,
    },
    Broadcast { asset: AssetReference },
    Disconnect,
}

impl From<ClientEvent> for RelayEvent {
    fn from(event: ClientEvent) -> Self {
        match event {
            ClientEvent::Register(identifier) => RelayEvent::Register { identifier },
            ClientEvent::SendToPeer(SendToPeerPayload {
                recipient_identifier,
                asset_reference,
            }) => RelayEvent::SendToPeer {
                recipient_identifier,
                asset: asset_reference,
            },
            ClientEvent::Broadcast(asset) => RelayEvent::Broadcast { asset },
        }
    }
}

/// The relay handler coordinates registration and delivery between
/// connections.
pub struct RelayHandler {
    registry: Arc<ConnectionRegistry>,
    clock: DeliveryClock,
}

impl RelayHandler {
    /// Create a new handler backed by a connection registry.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            clock: DeliveryClock::new(),
        }
    }

    /// Access the underlying registry.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Dispatch a single event for the connection described by `ctx`.
    ///
    /// Returns the reply for the originating connection, if the event has one.
    /// Deliveries to other connections are pushed onto their outbound queues.
    pub async fn dispatch(
        &self,
        ctx: &mut ConnectionContext,
        event: RelayEvent,
    ) -> Option<ServerEvent> {
        match event {
            RelayEvent::Register { identifier } => {
                self.registry.register(&identifier, ctx.conn_id).await;
                ctx.identifier = Some(identifier.clone());
                Some(ServerEvent::Registered(RegisteredPayload {
                    identifier,
                    connection_handle: ctx.conn_id,
                }))
            }

            RelayEvent::SendToPeer {
                recipient_identifier,
                asset,
            } => Some(self.send_to_peer(ctx, recipient_identifier, asset).await),

            RelayEvent::Broadcast { asset } => {
                self.broadcast(ctx, asset).await;
                None
            }

            RelayEvent::Disconnect => {
                let released = self.registry.remove(ctx.conn_id).await;
                let online = self.registry.connection_count().await;
                info!(
                    conn_id = ctx.conn_id,
                    identifier = ?ctx.identifier,
                    released = released.len(),
                    online,
                    "connection disconnected"
                );
                None
            }
        }
    }

    async fn send_to_peer(
        &self,
        ctx: &ConnectionContext,
        recipient_identifier: String,
        asset: AssetReference,
    ) -> ServerEvent {
        let Some((target_id, target_tx)) = self.registry.resolve(&recipient_identifier).await
        else {
            debug!(
                sender = %ctx.sender_label(),
                recipient = %recipient_identifier,
                "recipient not found"
            );
            return ServerEvent::ShareError(ShareErrorPayload {
                error: RECIPIENT_NOT_FOUND.to_string(),
            });
        };

        let delivery = self.delivery(ctx, asset);
        match target_tx {
            Some(tx) => deliver(&tx, target_id, delivery),
            None => debug!(target_id, "recipient connection already gone, dropping delivery"),
        }

        info!(
            sender = %ctx.sender_label(),
            recipient = %recipient_identifier,
            target_id,
            "image shared"
        );

        ServerEvent::ShareSent(ShareSentPayload {
            recipient_identifier,
            success: true,
        })
    }

    async fn broadcast(&self, ctx: &ConnectionContext, asset: AssetReference) {
        let targets = self.registry.others(ctx.conn_id).await;
        let delivery = self.delivery(ctx, asset);

        for (target_id, tx) in &targets {
            deliver(tx, *target_id, delivery.clone());
        }

        info!(
            sender = %ctx.sender_label(),
            recipients = targets.len(),
            "image broadcast"
        );
    }

    fn delivery(&self, ctx: &ConnectionContext, asset: AssetReference) -> ServerEvent {
        ServerEvent::ReceiveImage(Delivery {
            sender_identifier: ctx.sender_label().to_string(),
            asset,
            timestamp: self.clock.now(),
        })
    }
}

/// Hand an event to a connection's outbound queue without waiting.
///
/// A full or closed queue drops the event; the sender is never told.
fn deliver(tx: &mpsc::Sender<ServerEvent>, target_id: ConnectionId, event: ServerEvent) {
    match tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            warn!(target_id, event = event.name(), "outbound queue full, dropping delivery");
        }
        Err(TrySendError::Closed(_)) => {
            debug!(target_id, "outbound queue closed, dropping delivery");
        }
    }
}
