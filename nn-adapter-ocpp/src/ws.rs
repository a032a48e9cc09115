//! WebSocket transport
//!
//! Carries wire frames over OCPP WebSocket connections:
//! - client side dials one upstream node with the OCPP subprotocol and
//!   reconnects with exponential backoff
//! - server side accepts `<ws_path>/<nodeId>` connections from downstream
//!   peers and names each connection by that node id
//! - JSON framing travels in text messages, binary framing in binary
//!   messages
//!
//! Every connection has its own sender task fed by a bounded channel.
//! When a connection ends the node learns through
//! [`InboxItem::Disconnected`] and fails the requests pending on it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use nn_core::{Inbox, InboxItem, NodeId, SendResult, Transport, TransportError, WireFrame};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    accept_hdr_async_with_config, connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        handshake::server::{ErrorResponse, Request, Response},
        http::{header, HeaderValue, StatusCode},
        protocol::WebSocketConfig,
        Message,
    },
    WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AdapterConfig, UpstreamConfig};

/// Frames queued per connection before senders wait
const SEND_QUEUE: usize = 64;

struct PeerConnection {
    generation: u64,
    tx: mpsc::Sender<Message>,
}

/// WebSocket transport for one node
pub struct WebSocketTransport {
    config: AdapterConfig,
    connections: Mutex<HashMap<NodeId, PeerConnection>>,
    inbox: mpsc::UnboundedSender<InboxItem>,
    next_generation: AtomicU64,
}

impl WebSocketTransport {
    /// Create the transport and the inbox its connections feed
    pub fn new(config: AdapterConfig) -> (Arc<Self>, Inbox) {
        let (inbox_tx, inbox) = Inbox::channel(NodeId::new(config.node_id.clone()));
        let transport = Arc::new(Self {
            config,
            connections: Mutex::new(HashMap::new()),
            inbox: inbox_tx,
            next_generation: AtomicU64::new(0),
        });
        (transport, inbox)
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn is_connected(&self, peer: &NodeId) -> bool {
        self.connections.lock().contains_key(peer)
    }

    fn ws_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            max_message_size: Some(self.config.max_message_size),
            max_frame_size: Some(self.config.max_message_size),
            ..Default::default()
        }
    }

    // ========================================================================
    // Server side
    // ========================================================================

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<TcpListener, TransportError> {
        let addr = self
            .config
            .listen
            .ok_or_else(|| TransportError::InvalidUrl("no listen address configured".to_string()))?;
        let listener = TcpListener::bind(addr).await?;
        info!("Listening for OCPP {} peers on ws://{}{}", self.config.ocpp_version, addr, self.config.ws_path);
        Ok(listener)
    }

    /// Accept downstream peers until `shutdown` fires
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("Incoming connection from {}", addr);
                        let transport = self.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = transport.accept(stream, shutdown).await {
                                warn!("Rejected connection from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => error!("Accept failed: {}", e),
                },
                _ = shutdown.cancelled() => {
                    info!("Server for {} stopped", self.config.node_id);
                    break;
                }
            }
        }
    }

    async fn accept(&self, stream: TcpStream, shutdown: CancellationToken) -> Result<(), TransportError> {
        let subprotocol = self.config.ocpp_version.subprotocol();
        let base = self.config.ws_path.as_str();
        let mut peer = None;

        let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let Some(id) = peer_from_path(base, request.uri().path()) else {
                return Err(refusal(StatusCode::NOT_FOUND, "expected <path>/<nodeId>"));
            };
            match request.headers().get(header::SEC_WEBSOCKET_PROTOCOL) {
                Some(offered) if !offers(offered, subprotocol) => {
                    return Err(refusal(StatusCode::BAD_REQUEST, "unsupported OCPP subprotocol"));
                }
                Some(_) => {
                    response
                        .headers_mut()
                        .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(subprotocol));
                }
                None => warn!("{} connected without an OCPP subprotocol", id),
            }
            peer = Some(id);
            Ok(response)
        };

        let ws_stream = accept_hdr_async_with_config(stream, callback, Some(self.ws_config()))
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let peer = peer.ok_or_else(|| TransportError::Handshake("peer id missing".to_string()))?;

        info!("{} connected to {}", peer, self.config.node_id);
        self.drive(peer, ws_stream, shutdown).await;
        Ok(())
    }

    // ========================================================================
    // Client side
    // ========================================================================

    /// Keep the upstream connection alive until `shutdown` fires
    pub async fn run_upstream(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), TransportError> {
        let upstream = self
            .config
            .upstream
            .clone()
            .ok_or_else(|| TransportError::InvalidUrl("no upstream configured".to_string()))?;
        let mut reconnect_delay = self.config.reconnect_delay;

        loop {
            info!("Connecting to {} at {}", upstream.peer_id, upstream.url);

            match self.connect_upstream(&upstream, &shutdown).await {
                Ok(()) if shutdown.is_cancelled() => {
                    info!("Connection closed gracefully");
                    return Ok(());
                }
                Ok(()) => {
                    info!("Upstream {} went away", upstream.peer_id);
                    reconnect_delay = self.config.reconnect_delay;
                }
                Err(TransportError::InvalidUrl(url)) => return Err(TransportError::InvalidUrl(url)),
                Err(e) => error!("Connection error: {}", e),
            }

            // Exponential backoff
            info!("Reconnecting in {:?}", reconnect_delay);
            tokio::select! {
                _ = tokio::time::sleep(reconnect_delay) => {}
                _ = shutdown.cancelled() => return Ok(()),
            }
            reconnect_delay = self.config.next_reconnect_delay(reconnect_delay);
        }
    }

    /// Connect and run until disconnection
    async fn connect_upstream(&self, upstream: &UpstreamConfig, shutdown: &CancellationToken) -> Result<(), TransportError> {
        let url = self
            .config
            .upstream_url()
            .ok_or_else(|| TransportError::InvalidUrl(upstream.url.clone()))?;
        let subprotocol = self.config.ocpp_version.subprotocol();

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|_| TransportError::InvalidUrl(url.clone()))?;
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(subprotocol));

        let (ws_stream, response) = connect_async_with_config(request, Some(self.ws_config()), false)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        let accepted = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if accepted != Some(subprotocol) {
            warn!("{} did not accept {}, got: {:?}", upstream.peer_id, subprotocol, accepted);
        }

        info!("WebSocket connected to {}", url);
        self.drive(NodeId::new(upstream.peer_id.clone()), ws_stream, shutdown.clone())
            .await;
        Ok(())
    }

    // ========================================================================
    // Connection loop
    // ========================================================================

    /// Pump one established connection until either side closes it
    async fn drive<S>(&self, peer: NodeId, ws_stream: WebSocketStream<S>, shutdown: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (send_tx, mut send_rx) = mpsc::channel::<Message>(SEND_QUEUE);
        let generation = self.register(&peer, send_tx);

        // Ends once the registry drops the channel's sender
        let sender_peer = peer.clone();
        tokio::spawn(async move {
            while let Some(msg) = send_rx.recv().await {
                if let Err(e) = ws_tx.send(msg).await {
                    error!("Failed to send WebSocket message to {}: {}", sender_peer, e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    let frame = match msg {
                        Some(Ok(Message::Text(text))) => WireFrame::Text(text),
                        Some(Ok(Message::Binary(bytes))) => WireFrame::Binary(bytes),
                        Some(Ok(Message::Close(_))) => {
                            info!("WebSocket closed by {}", peer);
                            break;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            error!("WebSocket error from {}: {}", peer, e);
                            break;
                        }
                        None => {
                            info!("WebSocket stream from {} ended", peer);
                            break;
                        }
                    };
                    debug!("Received {} bytes from {}", frame.len(), peer);
                    let item = InboxItem::Frame { from: peer.clone(), frame };
                    if self.inbox.send(item).is_err() {
                        debug!("Node {} is gone, closing {}", self.config.node_id, peer);
                        break;
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        if self.unregister(&peer, generation) {
            let _ = self.inbox.send(InboxItem::Disconnected(peer));
        }
    }

    fn register(&self, peer: &NodeId, tx: mpsc::Sender<Message>) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .connections
            .lock()
            .insert(peer.clone(), PeerConnection { generation, tx });
        if previous.is_some() {
            warn!("{} reconnected, replacing its previous connection", peer);
        }
        generation
    }

    /// Remove `peer` unless a newer connection replaced it
    fn unregister(&self, peer: &NodeId, generation: u64) -> bool {
        let mut connections = self.connections.lock();
        match connections.get(peer) {
            Some(connection) if connection.generation == generation => {
                connections.remove(peer);
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send_frame(&self, connection: &NodeId, frame: WireFrame) -> SendResult {
        let Some(tx) = self.connections.lock().get(connection).map(|c| c.tx.clone()) else {
            return SendResult::NotConnected;
        };
        let msg = match frame {
            WireFrame::Text(text) => Message::Text(text),
            WireFrame::Binary(bytes) => Message::Binary(bytes),
        };
        match tx.send(msg).await {
            Ok(()) => SendResult::Sent,
            Err(_) => TransportError::ConnectionClosed.into(),
        }
    }

    fn connections(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self.connections.lock().keys().cloned().collect();
        peers.sort();
        peers
    }
}

/// Node id of a peer that connected to `path` under the `base` path
fn peer_from_path(base: &str, path: &str) -> Option<NodeId> {
    let rest = path.strip_prefix(base.trim_end_matches('/'))?;
    let id = rest.strip_prefix('/')?;
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(NodeId::new(id))
}

/// Whether a comma-separated subprotocol header offers `protocol`
fn offers(offered: &HeaderValue, protocol: &str) -> bool {
    offered
        .to_str()
        .map(|list| list.split(',').any(|p| p.trim() == protocol))
        .unwrap_or(false)
}

fn refusal(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}
