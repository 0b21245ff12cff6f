//! WebSocket listener using tokio-tungstenite.
//!
//! Each accepted TCP stream is upgraded in its own task; handshaken
//! connections are handed to the server over a channel. Relay events travel
//! as JSON text frames.

use futures_util::{SinkExt, StreamExt};
use picrelay_core::{RelayError, RelayResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

pub type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    /// The upgraded WebSocket stream.
    pub ws_stream: WsStream,
    /// Remote address.
    pub remote_addr: SocketAddr,
}

/// Browser origins allowed to open a socket. Empty means any origin.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    allowed: Arc<Vec<String>>,
}

impl OriginPolicy {
    pub fn new(allowed: Vec<String>) -> Self {
        Self {
            allowed: Arc::new(allowed),
        }
    }

    /// Requests without an `Origin` header (non-browser clients) are allowed.
    pub fn allows(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(_) if self.allowed.is_empty() => true,
            Some(origin) => self.allowed.iter().any(|o| o == "*" || o == origin),
        }
    }
}

/// Bind the WebSocket listener.
///
/// Returns the bound address and a receiver that yields handshaken
/// connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
    origins: OriginPolicy,
) -> RelayResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| RelayError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let origins = origins.clone();
                    tokio::spawn(async move {
                        let check = |req: &Request, resp: Response| check_origin(&origins, req, resp);
                        match tokio_tungstenite::accept_hdr_async(stream, check).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

fn check_origin(
    origins: &OriginPolicy,
    req: &Request,
    resp: Response,
) -> Result<Response, ErrorResponse> {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok());
    if origins.allows(origin) {
        return Ok(resp);
    }
    warn!(origin = ?origin, "rejecting WebSocket handshake from disallowed origin");
    let mut rejection = ErrorResponse::new(Some("origin not allowed".to_string()));
    *rejection.status_mut() = StatusCode::FORBIDDEN;
    Err(rejection)
}

/// Helper: send a text message over a WebSocket.
pub async fn ws_send_text(ws: &mut WsStream, text: String) -> RelayResult<()> {
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| RelayError::Transport(format!("WS send failed: {e}")))
}

/// Helper: receive the next text message from a WebSocket.
///
/// Returns `None` if the connection is closed. Binary messages are ignored.
/// Rejects frames larger than `max_frame_size`.
pub async fn ws_recv_text(ws: &mut WsStream, max_frame_size: usize) -> RelayResult<Option<String>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > max_frame_size {
                    return Err(RelayError::InvalidMessage(format!(
                        "WS frame too large: {} bytes (max {})",
                        text.len(),
                        max_frame_size
                    )));
                }
                return Ok(Some(text.to_string()));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(_)) => {
                // Binary, ping and pong frames carry nothing for the relay;
                // tungstenite queues the pong reply itself
                continue;
            }
            Some(Err(e)) => {
                return Err(RelayError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}
