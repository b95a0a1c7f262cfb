//! WebSocket transport
//!
//! Handles:
//! - Station-facing server connections (subprotocol `ocpp2.0.1`, station
//!   identity from the URL path)
//! - The uplink client towards the CSMS with exponential reconnect backoff
//! - The registry of live peers, which doubles as the next hop for relayed
//!   requests in both encodings

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use netnode_core::{
    ConnectionHandle, NetworkPath, NextHop, NodeId, OutboundTracker, RelayError, Response,
};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    accept_hdr_async_with_config, connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        handshake::server::{ErrorResponse, Request, Response as HandshakeResponse},
        http::{header, HeaderValue, StatusCode},
        protocol::WebSocketConfig,
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{UplinkConfig, OCPP_SUBPROTOCOL};
use crate::node::{NetworkingNode, PeerRole};
use crate::ocpp::{
    Action, BinaryMessage, BootNotificationRequest, BootNotificationResponse, BootReason, Call,
    ChargingStationInfo, OcppError, OcppMessage,
};

const OUTGOING_QUEUE: usize = 64;

/// Binary frames carry file contents, so allow more than plain OCPP-J needs
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
const MAX_FRAME_SIZE: usize = 1024 * 1024;

fn ws_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(MAX_MESSAGE_SIZE),
        max_frame_size: Some(MAX_FRAME_SIZE),
        ..Default::default()
    }
}

/// Frame queued for a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    Binary(Vec<u8>),
}

impl Outgoing {
    fn into_message(self) -> Message {
        match self {
            Outgoing::Text(text) => Message::Text(text),
            Outgoing::Binary(bytes) => Message::Binary(bytes),
        }
    }
}

struct Peer {
    connection: ConnectionHandle,
    role: PeerRole,
    tx: mpsc::Sender<Outgoing>,
}

/// Live peer connections by node id
#[derive(Clone)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<NodeId, Peer>>>,
    json_outbound: Arc<OutboundTracker<Action, Value>>,
    binary_outbound: Arc<OutboundTracker<Action, Vec<u8>>>,
    timeout: Duration,
}

impl PeerRegistry {
    pub fn new(
        json_outbound: Arc<OutboundTracker<Action, Value>>,
        binary_outbound: Arc<OutboundTracker<Action, Vec<u8>>>,
        timeout: Duration,
    ) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            json_outbound,
            binary_outbound,
            timeout,
        }
    }

    /// Add a connection; returns the connection it replaced
    pub fn register(
        &self,
        peer_id: impl Into<NodeId>,
        connection: ConnectionHandle,
        role: PeerRole,
        tx: mpsc::Sender<Outgoing>,
    ) -> Option<ConnectionHandle> {
        let peer_id = peer_id.into();
        debug!(peer = %peer_id, %connection, ?role, "Peer registered");
        self.peers
            .write()
            .insert(peer_id, Peer { connection, role, tx })
            .map(|previous| previous.connection)
    }

    /// Remove a peer, unless it has reconnected on another connection since
    pub fn unregister(&self, peer_id: &str, connection: ConnectionHandle) -> bool {
        let mut peers = self.peers.write();
        match peers.get(peer_id) {
            Some(peer) if peer.connection == connection => {
                peers.remove(peer_id);
                debug!(peer = peer_id, %connection, "Peer unregistered");
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.peers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    fn lookup(&self, peer_id: &str) -> Result<(ConnectionHandle, PeerRole, mpsc::Sender<Outgoing>), RelayError> {
        self.peers
            .read()
            .get(peer_id)
            .map(|p| (p.connection, p.role, p.tx.clone()))
            .ok_or_else(|| RelayError::UnknownPeer(peer_id.to_string()))
    }
}

impl NextHop<Action, Value> for PeerRegistry {
    fn relay(
        &self,
        target: &str,
        kind: Action,
        path: NetworkPath,
        request: Value,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Response<Value>, RelayError>> {
        let peer = self.lookup(target);
        let tracker = self.json_outbound.clone();
        let timeout = self.timeout;

        async move {
            let (connection, role, tx) = peer?;
            let (message_id, pending) =
                tracker.begin(kind, role.outbound_direction(), connection, path.clone(), request.clone());

            let call = OcppMessage::Call(Call {
                message_id: message_id.clone(),
                action: kind,
                payload: request,
                network_path: Some(path),
            });
            let frame = match call.to_text() {
                Ok(frame) => frame,
                Err(e) => {
                    tracker.abandon(&message_id);
                    return Err(RelayError::Encode(e.to_string()));
                }
            };

            if tx.send(Outgoing::Text(frame)).await.is_err() {
                tracker.abandon(&message_id);
                return Err(RelayError::ConnectionClosed);
            }
            pending.wait(timeout, cancel).await
        }
        .boxed()
    }
}

impl NextHop<Action, Vec<u8>> for PeerRegistry {
    fn relay(
        &self,
        target: &str,
        kind: Action,
        path: NetworkPath,
        request: Vec<u8>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Response<Vec<u8>>, RelayError>> {
        let peer = self.lookup(target);
        let tracker = self.binary_outbound.clone();
        let timeout = self.timeout;

        async move {
            let (connection, role, tx) = peer?;
            let (message_id, pending) =
                tracker.begin(kind, role.outbound_direction(), connection, path.clone(), request.clone());

            let call = BinaryMessage::Call {
                message_id: message_id.clone(),
                action: kind,
                network_path: Some(path),
                payload: request,
            };
            let frame = match call.encode() {
                Ok(frame) => frame,
                Err(e) => {
                    tracker.abandon(&message_id);
                    return Err(RelayError::Encode(e.to_string()));
                }
            };

            if tx.send(Outgoing::Binary(frame)).await.is_err() {
                tracker.abandon(&message_id);
                return Err(RelayError::ConnectionClosed);
            }
            pending.wait(timeout, cancel).await
        }
        .boxed()
    }
}

/// One registered WebSocket connection to a peer
pub struct PeerConnection<S> {
    node: NetworkingNode,
    peer_id: NodeId,
    role: PeerRole,
    connection: ConnectionHandle,
    cancel: CancellationToken,
    tx: mpsc::Sender<Outgoing>,
    ws_rx: SplitStream<WebSocketStream<S>>,
    writer: JoinHandle<()>,
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Register the peer and start its writer.
    ///
    /// `shutdown` cancels every request still being handled for this peer.
    pub fn open(
        ws: WebSocketStream<S>,
        node: NetworkingNode,
        peer_id: impl Into<NodeId>,
        role: PeerRole,
        shutdown: &CancellationToken,
    ) -> Self {
        let peer_id = peer_id.into();
        let connection = ConnectionHandle::next();
        let (mut ws_tx, ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::channel::<Outgoing>(OUTGOING_QUEUE);

        if let Some(previous) = node.peers().register(peer_id.clone(), connection, role, tx.clone()) {
            warn!(peer = %peer_id, %previous, %connection, "Peer reconnected, replacing previous connection");
        }

        let writer_peer = peer_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                if let Err(e) = ws_tx.send(out.into_message()).await {
                    error!(peer = %writer_peer, "Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        Self {
            node,
            peer_id,
            role,
            connection,
            cancel: shutdown.child_token(),
            tx,
            ws_rx,
            writer,
        }
    }

    pub fn connection(&self) -> ConnectionHandle {
        self.connection
    }

    /// Read frames until the peer goes away or shutdown is requested.
    ///
    /// Every frame is handled on its own task so a slow handler does not
    /// hold up the connection.
    pub async fn run(mut self) -> Result<(), OcppError> {
        let result = loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                msg = self.ws_rx.next() => msg,
            };

            match msg {
                Some(Ok(Message::Text(text))) => {
                    debug!(peer = %self.peer_id, "Received: {}", text);
                    let (node, tx, peer, role, conn) = self.task_parts();
                    let cancel = self.cancel.child_token();
                    tokio::spawn(async move {
                        if let Some(reply) = node.handle_text(&text, &peer, role, conn, cancel).await {
                            let _ = tx.send(Outgoing::Text(reply)).await;
                        }
                    });
                }
                Some(Ok(Message::Binary(bytes))) => {
                    debug!(peer = %self.peer_id, len = bytes.len(), "Received binary frame");
                    let (node, tx, peer, role, conn) = self.task_parts();
                    let cancel = self.cancel.child_token();
                    tokio::spawn(async move {
                        if let Some(reply) = node.handle_binary(&bytes, &peer, role, conn, cancel).await {
                            let _ = tx.send(Outgoing::Binary(reply)).await;
                        }
                    });
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(peer = %self.peer_id, ?frame, "WebSocket closed by peer");
                    break Ok(());
                }
                // Ping/pong is answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(peer = %self.peer_id, "WebSocket error: {}", e);
                    break Err(OcppError::WebSocket(e.to_string()));
                }
                None => {
                    info!(peer = %self.peer_id, "WebSocket stream ended");
                    break Ok(());
                }
            }
        };

        self.cancel.cancel();
        self.node.peers().unregister(&self.peer_id, self.connection);
        self.node.connection_closed(self.connection);
        drop(self.tx);
        self.writer.abort();
        result
    }

    fn task_parts(&self) -> (NetworkingNode, mpsc::Sender<Outgoing>, NodeId, PeerRole, ConnectionHandle) {
        (
            self.node.clone(),
            self.tx.clone(),
            self.peer_id.clone(),
            self.role,
            self.connection,
        )
    }
}

/// Last non-empty segment of the handshake path: `/ocpp/CS-001` -> `CS-001`
pub fn station_id_from_path(path: &str) -> Option<&str> {
    path.rsplit('/').find(|segment| !segment.is_empty())
}

fn offers_subprotocol(request: &Request, protocol: &str) -> bool {
    request
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(|offered| offered.split(',').any(|p| p.trim() == protocol))
        .unwrap_or(false)
}

/// Serve one charging station (or downstream node) connection
pub async fn serve_station(
    stream: TcpStream,
    node: NetworkingNode,
    shutdown: CancellationToken,
) -> Result<(), OcppError> {
    let remote = stream.peer_addr().ok();
    let mut station_id = None;

    let callback = |request: &Request, mut response: HandshakeResponse| -> Result<HandshakeResponse, ErrorResponse> {
        let Some(id) = station_id_from_path(request.uri().path()) else {
            let mut refused = ErrorResponse::new(Some("missing charging station identity".to_string()));
            *refused.status_mut() = StatusCode::NOT_FOUND;
            return Err(refused);
        };
        station_id = Some(id.to_string());

        if offers_subprotocol(request, OCPP_SUBPROTOCOL) {
            response
                .headers_mut()
                .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(OCPP_SUBPROTOCOL));
        } else {
            warn!(station = id, "Station did not offer the OCPP 2.0.1 subprotocol");
        }
        Ok(response)
    };

    let ws = accept_hdr_async_with_config(stream, callback, Some(ws_config()))
        .await
        .map_err(|e| OcppError::WebSocket(e.to_string()))?;
    let station_id = station_id.ok_or(OcppError::InvalidFormat("missing charging station identity"))?;

    info!(station = %station_id, ?remote, "Station connected");
    PeerConnection::open(ws, node, station_id, PeerRole::Station, &shutdown)
        .run()
        .await
}

/// Connection towards the CSMS (or an upstream networking node)
pub struct Uplink {
    node: NetworkingNode,
    config: UplinkConfig,
    boot: Option<ChargingStationInfo>,
}

impl Uplink {
    pub fn new(node: NetworkingNode, config: UplinkConfig) -> Self {
        Self {
            node,
            config,
            boot: None,
        }
    }

    /// Announce the node with a BootNotification after every connect
    pub fn with_boot_notification(mut self, info: ChargingStationInfo) -> Self {
        self.boot = Some(info);
        self
    }

    pub fn endpoint(&self) -> String {
        self.config.endpoint(self.node.node_id())
    }

    /// Keep the uplink alive until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), OcppError> {
        let mut reconnect_delay = self.config.reconnect_delay;

        loop {
            info!("Connecting to CSMS: {}", self.endpoint());

            let attempt = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                attempt = self.connect() => attempt,
            };

            match attempt {
                Ok(ws) => {
                    reconnect_delay = self.config.reconnect_delay;
                    let conn = PeerConnection::open(
                        ws,
                        self.node.clone(),
                        self.config.csms_id.clone(),
                        PeerRole::Upstream,
                        &shutdown,
                    );
                    if let Some(info) = &self.boot {
                        self.spawn_boot(info.clone(), shutdown.child_token());
                    }
                    match conn.run().await {
                        Ok(()) => info!("Uplink closed"),
                        Err(e) => error!("Uplink error: {}", e),
                    }
                }
                Err(e) => error!("Connection error: {}", e),
            }

            if shutdown.is_cancelled() {
                return Ok(());
            }

            // Exponential backoff
            info!("Reconnecting in {:?}", reconnect_delay);
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(reconnect_delay) => {}
            }
            reconnect_delay = std::cmp::min(reconnect_delay * 2, self.config.max_reconnect_delay);
        }
    }

    async fn connect(&self) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, OcppError> {
        let url = self.endpoint();
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| OcppError::WebSocket(e.to_string()))?;
        let protocol = HeaderValue::from_str(&self.config.subprotocol)
            .map_err(|_| OcppError::InvalidFormat("subprotocol is not a valid header value"))?;
        request.headers_mut().insert(header::SEC_WEBSOCKET_PROTOCOL, protocol);

        let (ws_stream, response) = connect_async_with_config(request, Some(ws_config()), false)
            .await
            .map_err(|e| OcppError::WebSocket(e.to_string()))?;

        // Verify subprotocol
        let accepted_protocol = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());

        if accepted_protocol != Some(self.config.subprotocol.as_str()) {
            warn!(
                "CSMS did not accept subprotocol {}, got: {:?}",
                self.config.subprotocol, accepted_protocol
            );
        }

        info!("WebSocket connected to {}", url);
        Ok(ws_stream)
    }

    fn spawn_boot(&self, info: ChargingStationInfo, cancel: CancellationToken) {
        let node = self.node.clone();
        let csms_id = self.config.csms_id.clone();
        let timeout = self.config.request_timeout;

        tokio::spawn(async move {
            let request = BootNotificationRequest {
                charging_station: info,
                reason: BootReason::PowerUp,
            };
            let payload = match serde_json::to_value(&request) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Failed to encode BootNotification: {}", e);
                    return;
                }
            };

            let answer = tokio::time::timeout(
                timeout,
                node.call(&csms_id, Action::BootNotification, payload, cancel),
            )
            .await;

            match answer {
                Ok(Ok(Response::Result(value))) => match serde_json::from_value::<BootNotificationResponse>(value) {
                    Ok(boot) => info!(status = ?boot.status, interval = boot.interval, "BootNotification answered"),
                    Err(e) => warn!("Malformed BootNotification response: {}", e),
                },
                Ok(Ok(Response::Error(fault))) => warn!(%fault, "BootNotification refused"),
                Ok(Err(e)) => warn!("BootNotification not delivered: {}", e),
                Err(_) => warn!("BootNotification timed out after {:?}", timeout),
            }
        });
    }
}
