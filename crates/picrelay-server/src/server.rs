//! Core server: accepts connections and runs one relay session per client.
//!
//! Owns the connection registry and relay handler, and coordinates the
//! lifecycle (including shutdown) of every connection.

use crate::config::ServerConfig;
use crate::relay::{ConnectionContext, ConnectionRegistry, RelayEvent, RelayHandler};
use crate::transport::websocket::{self, OriginPolicy, WebSocketConnection};
use picrelay_core::messages::{ErrorPayload, ShutdownPayload};
use picrelay_core::{decode_event, encode_event, ClientEvent, RelayError, RelayResult, ServerEvent};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// The relay server instance.
pub struct RelayServer {
    /// Server configuration.
    config: ServerConfig,
    /// Relay handler (owns a reference to the registry).
    handler: Arc<RelayHandler>,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Create a new server instance.
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let handler = Arc::new(RelayHandler::new(registry));

        Self {
            config,
            handler,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    /// Handle used to stop a running server.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(self) -> RelayResult<()> {
        let origins = OriginPolicy::new(self.config.allowed_origins.clone());
        let (local_addr, ws_rx) = websocket::start_listener(self.config.bind_addr, origins).await?;

        info!(
            addr = %local_addr,
            allowed_origins = ?self.config.allowed_origins,
            "picrelay-server ready"
        );

        self.serve(ws_rx).await
    }

    /// Accept connections from `ws_rx` until shutdown is requested or the
    /// listener goes away, then wait for every connection task to finish.
    pub async fn serve(self, mut ws_rx: mpsc::Receiver<WebSocketConnection>) -> RelayResult<()> {
        let server = Arc::new(self);
        let mut shutdown_rx = server.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("shutdown requested, stopping accept loop");
                    break;
                }
                accepted = ws_rx.recv() => {
                    let Some(ws_conn) = accepted else {
                        info!("listener closed, shutting down");
                        break;
                    };
                    let srv = server.clone();
                    // Subscribe before spawning so a shutdown sent right after
                    // this accept still reaches the connection task.
                    let conn_shutdown_rx = server.shutdown_tx.subscribe();
                    connections.spawn(async move {
                        let remote = ws_conn.remote_addr;
                        if let Err(e) = srv.handle_websocket(ws_conn, conn_shutdown_rx).await {
                            warn!(remote = %remote, error = %e, "WebSocket connection error");
                        }
                    });
                }
                // Reap finished connection tasks so the set does not grow unbounded
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        // Connection tasks observe the same shutdown signal; if the listener
        // closed on its own, trigger it so they notify their clients.
        let _ = server.shutdown_tx.send(());
        debug!(remaining = connections.len(), "waiting for connections to close");
        while connections.join_next().await.is_some() {}

        info!("all connections closed");
        Ok(())
    }

    /// Handle a WebSocket connection from accept to disconnect.
    async fn handle_websocket(
        &self,
        mut conn: WebSocketConnection,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> RelayResult<()> {
        let registry = self.handler.registry();
        let conn_id = registry.next_connection_id();
        let (peer_tx, peer_rx) = mpsc::channel::<ServerEvent>(self.config.outbound_queue);
        registry.connect(conn_id, peer_tx).await;

        info!(remote = %conn.remote_addr, conn_id, "client connected");

        let mut ctx = ConnectionContext::new(conn_id);
        let result = self
            .session_loop_ws(&mut conn, &mut ctx, peer_rx, shutdown_rx)
            .await;

        // Cleanup runs whatever ended the session
        self.handler.dispatch(&mut ctx, RelayEvent::Disconnect).await;

        result
    }

    /// Relay message loop over WebSocket.
    async fn session_loop_ws(
        &self,
        conn: &mut WebSocketConnection,
        ctx: &mut ConnectionContext,
        mut peer_rx: mpsc::Receiver<ServerEvent>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> RelayResult<()> {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(conn_id = ctx.conn_id, "shutdown signal received, notifying client");
                    let shutdown_msg = ServerEvent::Shutdown(ShutdownPayload {
                        reason: "server shutdown".into(),
                    });
                    if let Ok(text) = encode_event(&shutdown_msg) {
                        let _ = websocket::ws_send_text(&mut conn.ws_stream, text).await;
                    }
                    let _ = conn.ws_stream.close(None).await;
                    break;
                }

                // Deliveries pushed by other connections
                Some(event) = peer_rx.recv() => {
                    let text = encode_event(&event)?;
                    websocket::ws_send_text(&mut conn.ws_stream, text).await?;
                }

                ws_result = websocket::ws_recv_text(&mut conn.ws_stream, self.config.max_frame_size) => {
                    match ws_result {
                        Ok(Some(text)) => {
                            if let Some(reply) = self.handle_frame(ctx, &text).await {
                                let text = encode_event(&reply)?;
                                websocket::ws_send_text(&mut conn.ws_stream, text).await?;
                            }
                        }
                        Ok(None) => {
                            debug!(conn_id = ctx.conn_id, "WebSocket session ended (peer closed)");
                            break;
                        }
                        Err(e @ RelayError::InvalidMessage(_)) => return Err(e),
                        Err(e) => {
                            debug!(conn_id = ctx.conn_id, error = %e, "WebSocket session ended");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Decode one inbound frame and dispatch it. Undecodable frames are
    /// answered with an `error` event; the connection stays open.
    async fn handle_frame(&self, ctx: &mut ConnectionContext, text: &str) -> Option<ServerEvent> {
        match decode_event::<ClientEvent>(text) {
            Ok(event) => {
                debug!(conn_id = ctx.conn_id, ?event, "inbound event");
                self.handler.dispatch(ctx, RelayEvent::from(event)).await
            }
            Err(e) => {
                debug!(conn_id = ctx.conn_id, error = %e, "undecodable frame");
                Some(ServerEvent::Error(ErrorPayload {
                    message: e.to_string(),
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use picrelay_core::messages::{AssetReference, SendToPeerPayload};
    use serde_json::json;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start_server(
        config: ServerConfig,
    ) -> (SocketAddr, broadcast::Sender<()>, tokio::task::JoinHandle<RelayResult<()>>) {
        let origins = OriginPolicy::new(config.allowed_origins.clone());
        let (addr, rx) = websocket::start_listener("127.0.0.1:0".parse().unwrap(), origins)
            .await
            .unwrap();
        let server = RelayServer::new(config);
        let shutdown = server.shutdown_handle();
        let task = tokio::spawn(server.serve(rx));
        (addr, shutdown, task)
    }

    async fn client(addr: SocketAddr) -> Client {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        ws
    }

    async fn send(ws: &mut Client, event: &ClientEvent) {
        ws.send(Message::Text(encode_event(event).unwrap().into()))
            .await
            .unwrap();
    }

    async fn send_raw(ws: &mut Client, text: &str) {
        ws.send(Message::Text(text.to_string().into())).await.unwrap();
    }

    async fn recv(ws: &mut Client) -> ServerEvent {
        let next = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => return text.to_string(),
                    Some(Ok(_)) => continue,
                    other => panic!("connection ended: {other:?}"),
                }
            }
        })
        .await
        .expect("timed out waiting for event");
        decode_event(&next).unwrap()
    }

    async fn expect_silence(ws: &mut Client) {
        let result = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
        assert!(result.is_err(), "unexpected frame: {result:?}");
    }

    async fn register(ws: &mut Client, identifier: &str) {
        send(ws, &ClientEvent::Register(identifier.into())).await;
        match recv(ws).await {
            ServerEvent::Registered(p) => assert_eq!(p.identifier, identifier),
            other => panic!("expected registered, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn alice_shares_with_bob() {
        let (addr, _shutdown, _task) = start_server(ServerConfig::default()).await;
        let mut alice = client(addr).await;
        let mut bob = client(addr).await;
        register(&mut alice, "alice").await;
        register(&mut bob, "bob").await;

        send(
            &mut alice,
            &ClientEvent::SendToPeer(SendToPeerPayload {
                recipient_identifier: "bob".into(),
                asset_reference: AssetReference::new("/x.png", "x.png"),
            }),
        )
        .await;

        match recv(&mut alice).await {
            ServerEvent::ShareSent(p) => {
                assert_eq!(p.recipient_identifier, "bob");
                assert!(p.success);
            }
            other => panic!("expected shareSent, got {other:?}"),
        }
        match recv(&mut bob).await {
            ServerEvent::ReceiveImage(d) => {
                assert_eq!(d.sender_identifier, "alice");
                assert_eq!(d.asset, AssetReference::new("/x.png", "x.png"));
            }
            other => panic!("expected receiveImage, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn legacy_share_image_frame_is_relayed() {
        let (addr, _shutdown, _task) = start_server(ServerConfig::default()).await;
        let mut alice = client(addr).await;
        let mut bob = client(addr).await;
        register(&mut alice, "alice").await;
        register(&mut bob, "bob").await;

        send_raw(
            &mut alice,
            r#"{"event":"shareImage","data":{"recipientId":"bob","imageData":{"imageUrl":"/api/images/1.gif","filename":"1.gif"}}}"#,
        )
        .await;

        assert!(matches!(recv(&mut alice).await, ServerEvent::ShareSent(_)));
        assert!(matches!(recv(&mut bob).await, ServerEvent::ReceiveImage(_)));
    }

    #[tokio::test]
    async fn non_string_asset_fields_arrive_unchanged() {
        let (addr, _shutdown, _task) = start_server(ServerConfig::default()).await;
        let mut alice = client(addr).await;
        let mut bob = client(addr).await;
        register(&mut alice, "alice").await;
        register(&mut bob, "bob").await;

        send_raw(
            &mut alice,
            r#"{"event":"sendToPeer","data":{"recipientIdentifier":"bob","assetReference":{"imageUrl":123,"size":"2kb"}}}"#,
        )
        .await;

        assert!(matches!(recv(&mut alice).await, ServerEvent::ShareSent(_)));
        match recv(&mut bob).await {
            ServerEvent::ReceiveImage(d) => {
                assert_eq!(d.asset.image_url, Some(json!(123)));
                assert_eq!(d.asset.size, Some(json!("2kb")));
                assert_eq!(d.asset.filename, None);
            }
            other => panic!("expected receiveImage, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unregistered_sender_to_unknown_recipient_gets_share_error() {
        let (addr, _shutdown, _task) = start_server(ServerConfig::default()).await;
        let mut a = client(addr).await;
        let mut other = client(addr).await;

        send(
            &mut a,
            &ClientEvent::SendToPeer(SendToPeerPayload {
                recipient_identifier: "bob".into(),
                asset_reference: AssetReference::new("/x.png", "x.png"),
            }),
        )
        .await;

        match recv(&mut a).await {
            ServerEvent::ShareError(p) => assert_eq!(p.error, "Recipient not found or offline"),
            other => panic!("expected shareError, got {other:?}"),
        }
        expect_silence(&mut other).await;
    }

    #[tokio::test]
    async fn broadcast_skips_sender() {
        let (addr, _shutdown, _task) = start_server(ServerConfig::default()).await;
        let mut sender = client(addr).await;
        let mut first = client(addr).await;
        let mut second = client(addr).await;
        register(&mut sender, "sam").await;
        // Make sure the two receivers are tracked before broadcasting
        register(&mut first, "first").await;
        register(&mut second, "second").await;

        send(
            &mut sender,
            &ClientEvent::Broadcast(AssetReference::new("/b.jpg", "b.jpg")),
        )
        .await;

        for ws in [&mut first, &mut second] {
            match recv(ws).await {
                ServerEvent::ReceiveImage(d) => assert_eq!(d.sender_identifier, "sam"),
                other => panic!("expected receiveImage, got {other:?}"),
            }
        }
        expect_silence(&mut sender).await;
    }

    #[tokio::test]
    async fn disconnect_releases_identifier() {
        let (addr, _shutdown, _task) = start_server(ServerConfig::default()).await;
        let mut alice = client(addr).await;
        let mut bob = client(addr).await;
        register(&mut alice, "alice").await;
        register(&mut bob, "bob").await;

        alice.close(None).await.unwrap();
        drop(alice);

        // Disconnect cleanup is asynchronous; poll until the share fails.
        let mut released = false;
        for _ in 0..50 {
            send(
                &mut bob,
                &ClientEvent::SendToPeer(SendToPeerPayload {
                    recipient_identifier: "alice".into(),
                    asset_reference: AssetReference::default(),
                }),
            )
            .await;
            if matches!(recv(&mut bob).await, ServerEvent::ShareError(_)) {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(released, "alice was never released");
    }

    #[tokio::test]
    async fn malformed_frame_gets_error_and_connection_survives() {
        let (addr, _shutdown, _task) = start_server(ServerConfig::default()).await;
        let mut ws = client(addr).await;

        send_raw(&mut ws, "{not json").await;
        assert!(matches!(recv(&mut ws).await, ServerEvent::Error(_)));

        register(&mut ws, "still-here").await;
    }

    #[tokio::test]
    async fn shutdown_notifies_clients() {
        let (addr, shutdown, task) = start_server(ServerConfig::default()).await;
        let mut ws = client(addr).await;
        register(&mut ws, "alice").await;

        shutdown.send(()).unwrap();

        match recv(&mut ws).await {
            ServerEvent::Shutdown(p) => assert_eq!(p.reason, "server shutdown"),
            other => panic!("expected shutdown, got {other:?}"),
        }
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_right_after_accept_does_not_hang() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // A connection task spawned in the same step as the shutdown must
        // still observe it; repeat to cover both select! orderings.
        for _ in 0..20 {
            let (client_result, ws_conn) = tokio::join!(
                tokio_tungstenite::connect_async(format!("ws://{addr}")),
                async {
                    let (stream, remote_addr) = listener.accept().await.unwrap();
                    let ws_stream = tokio_tungstenite::accept_async(stream).await.unwrap();
                    WebSocketConnection {
                        ws_stream,
                        remote_addr,
                    }
                }
            );
            let (_client, _) = client_result.unwrap();

            let (tx, rx) = mpsc::channel(1);
            assert!(tx.send(ws_conn).await.is_ok());
            let server = RelayServer::new(ServerConfig::default());
            let shutdown = server.shutdown_handle();
            let task = tokio::spawn(server.serve(rx));
            shutdown.send(()).unwrap();

            tokio::time::timeout(Duration::from_secs(2), task)
                .await
                .expect("serve did not finish after shutdown")
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn ping_is_answered_by_a_single_pong() {
        let (addr, _shutdown, _task) = start_server(ServerConfig::default()).await;
        let mut ws = client(addr).await;

        ws.send(Message::Ping(b"hb".to_vec().into())).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for pong");
        match reply {
            Some(Ok(Message::Pong(payload))) => assert_eq!(&payload[..], b"hb"),
            other => panic!("expected pong, got {other:?}"),
        }
        expect_silence(&mut ws).await;

        register(&mut ws, "alice").await;
    }

    #[tokio::test]
    async fn disallowed_origin_is_rejected() {
        let config = ServerConfig {
            allowed_origins: vec!["http://localhost:5173".into()],
            ..ServerConfig::default()
        };
        let (addr, _shutdown, _task) = start_server(config).await;

        let mut request = format!("ws://{addr}").into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Origin", "http://evil.example".parse().unwrap());
        assert!(tokio_tungstenite::connect_async(request).await.is_err());

        let mut request = format!("ws://{addr}").into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Origin", "http://localhost:5173".parse().unwrap());
        assert!(tokio_tungstenite::connect_async(request).await.is_ok());
    }
}
