//! Networking node
//!
//! Glue between the wire codecs and the dispatch core. A `NetworkingNode`
//! owns one dispatcher per encoding (JSON text and binary), the outbound
//! trackers for requests it relays, and the registry of connected peers.
//!
//! ## Message Flow
//!
//! 1. A peer connection hands every received frame to `handle_text` or
//!    `handle_binary`
//! 2. CALL frames are dispatched; direction follows the peer's role
//! 3. Handlers answer locally or relay through the `PeerRegistry`
//! 4. CALLRESULT / CALLERROR frames resolve the matching outbound request

use std::sync::Arc;

use netnode_core::{
    handler_fn, ConnectionHandle, DecodeError, Direction, DispatchConfig, Dispatcher, ErrorSink, Fault, FaultCode,
    Handler, HandlerError, InboundRequest, NetworkPath, NextHop, NodeId, OutboundTracker, Payload, RelayError,
    RelayHandler, RequestContext, Response, RouteMode,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::connection::PeerRegistry;
use crate::ocpp::{Action, BinaryMessage, CallError, OcppError, OcppMessage};

/// Which side of the node a connection is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerRole {
    /// Charging station or downstream networking node
    Station,
    /// CSMS or upstream networking node
    Upstream,
}

impl PeerRole {
    /// Direction of requests received from this peer
    pub fn inbound_direction(self) -> Direction {
        match self {
            PeerRole::Station => Direction::DeviceToSystem,
            PeerRole::Upstream => Direction::SystemToDevice,
        }
    }

    /// Direction of requests sent to this peer
    pub fn outbound_direction(self) -> Direction {
        self.inbound_direction().reverse()
    }
}

/// One networking node; clones share all state
#[derive(Clone)]
pub struct NetworkingNode {
    node_id: NodeId,
    json: Dispatcher<Action, Value>,
    binary: Dispatcher<Action, Vec<u8>>,
    json_outbound: Arc<OutboundTracker<Action, Value>>,
    binary_outbound: Arc<OutboundTracker<Action, Vec<u8>>>,
    peers: PeerRegistry,
}

impl NetworkingNode {
    pub fn new(config: &NodeConfig, sink: Arc<dyn ErrorSink>) -> Self {
        let dispatch = DispatchConfig {
            node_id: config.node_id.clone(),
            ..config.dispatch.clone()
        };
        let json_outbound = Arc::new(OutboundTracker::new(config.node_id.clone()));
        let binary_outbound = Arc::new(OutboundTracker::new(config.node_id.clone()));
        let peers = PeerRegistry::new(json_outbound.clone(), binary_outbound.clone(), config.relay_timeout);

        Self {
            node_id: config.node_id.clone(),
            json: Dispatcher::new(dispatch.clone(), sink.clone()),
            binary: Dispatcher::new(dispatch, sink),
            json_outbound,
            binary_outbound,
            peers,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Dispatcher for OCPP-J text frames
    pub fn json(&self) -> &Dispatcher<Action, Value> {
        &self.json
    }

    /// Dispatcher for binary frames
    pub fn binary(&self) -> &Dispatcher<Action, Vec<u8>> {
        &self.binary
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    /// Outstanding relayed requests over both encodings
    pub fn pending_requests(&self) -> usize {
        self.json_outbound.len() + self.binary_outbound.len()
    }

    /// Path of a request that arrived without one.
    ///
    /// Upward the sender is the originator. Downward a bare frame is meant
    /// for this node.
    fn default_path(&self, sender: &str, direction: Direction) -> NetworkPath {
        match direction {
            Direction::DeviceToSystem => NetworkPath::from_source(sender),
            Direction::SystemToDevice => NetworkPath::from_source(self.node_id.clone()),
        }
    }

    /// Handle one OCPP-J text frame; returns the reply to send, if any
    pub async fn handle_text(
        &self,
        frame: &str,
        sender: &str,
        role: PeerRole,
        connection: ConnectionHandle,
        cancel: CancellationToken,
    ) -> Option<String> {
        let call = match OcppMessage::parse(frame.as_bytes()) {
            Ok(OcppMessage::Call(call)) => call,
            Ok(answer) => {
                if let Some((message_id, response)) = answer.into_response() {
                    self.json_outbound.resolve(&message_id, response);
                }
                return None;
            }
            Err(e) => {
                warn!(%sender, error = %e, "Undecodable text frame");
                let message_id = OcppMessage::recover_message_id(frame.as_bytes());
                let action = OcppMessage::recover_action(frame.as_bytes());
                let fault = undecodable(&self.json, sender, action, message_id.as_deref(), e);
                return encode_text(&OcppMessage::CallError(CallError::from_fault(message_id?, &fault)));
            }
        };

        let direction = role.inbound_direction();
        let path = call
            .network_path
            .unwrap_or_else(|| self.default_path(sender, direction));
        let inbound = InboundRequest::new(
            call.message_id.clone(),
            call.action,
            direction,
            sender,
            connection,
            path,
            call.payload,
        );

        let dispatched = self.json.dispatch(inbound, cancel).await;
        if let Some(bytes) = dispatched.encoded_override {
            match String::from_utf8(bytes) {
                Ok(text) => return Some(text),
                Err(e) => warn!(message_id = %call.message_id, error = %e, "Encoded override is not UTF-8, encoding response"),
            }
        }
        encode_text(&OcppMessage::from_response(call.message_id, &dispatched.response))
    }

    /// Handle one binary frame; returns the reply to send, if any
    pub async fn handle_binary(
        &self,
        frame: &[u8],
        sender: &str,
        role: PeerRole,
        connection: ConnectionHandle,
        cancel: CancellationToken,
    ) -> Option<Vec<u8>> {
        let (message_id, action, network_path, payload) = match BinaryMessage::decode(frame) {
            Ok(BinaryMessage::Call {
                message_id,
                action,
                network_path,
                payload,
            }) => (message_id, action, network_path, payload),
            Ok(answer) => {
                if let Some((message_id, response)) = answer.into_response() {
                    self.binary_outbound.resolve(&message_id, response);
                }
                return None;
            }
            Err(e) => {
                warn!(%sender, error = %e, "Undecodable binary frame");
                let message_id = BinaryMessage::recover_message_id(frame);
                let action = BinaryMessage::recover_action(frame);
                let fault = undecodable(&self.binary, sender, action, message_id.as_deref(), e);
                return encode_binary(&BinaryMessage::from_response(message_id?, &Response::Error(fault)));
            }
        };

        let direction = role.inbound_direction();
        let path = network_path.unwrap_or_else(|| self.default_path(sender, direction));
        let inbound = InboundRequest::new(message_id.clone(), action, direction, sender, connection, path, payload);

        let dispatched = self.binary.dispatch(inbound, cancel).await;
        if let Some(bytes) = dispatched.encoded_override {
            return Some(bytes);
        }
        encode_binary(&BinaryMessage::from_response(message_id, &dispatched.response))
    }

    /// Relay every request arriving from stations to `target` (upward),
    /// recording this node on the network path
    pub fn relay_upward(&self, target: impl Into<NodeId>) {
        let target = target.into();
        info!(node = %self.node_id, %target, "Relaying station requests upward");

        let json = RelayHandler::new(
            self.node_id.clone(),
            RouteMode::Append { target: target.clone() },
            self.json_next_hop(),
        )
        .into_handler();
        let binary = RelayHandler::new(
            self.node_id.clone(),
            RouteMode::Append { target },
            self.binary_next_hop(),
        )
        .into_handler();

        for action in Action::arriving(Direction::DeviceToSystem) {
            if action.is_binary() {
                self.binary
                    .handlers()
                    .register_handler(Direction::DeviceToSystem, action, binary.clone());
            } else {
                self.json
                    .handlers()
                    .register_handler(Direction::DeviceToSystem, action, json.clone());
            }
        }
    }

    /// Relay requests from upstream along their planned path (downward).
    ///
    /// Requests whose path ends at this node go to the handler registered
    /// before this call, or are answered NotImplemented.
    pub fn relay_downward(&self) {
        info!(node = %self.node_id, "Relaying upstream requests downward");
        let dir = Direction::SystemToDevice;

        for action in Action::arriving(dir) {
            if action.is_binary() {
                let local = self
                    .binary
                    .handlers()
                    .lookup(dir, &action)
                    .unwrap_or_else(not_for_us);
                let relay = RelayHandler::new(self.node_id.clone(), RouteMode::SourceRouted, self.binary_next_hop())
                    .with_local(local)
                    .into_handler();
                self.binary.handlers().register_handler(dir, action, relay);
            } else {
                let local = self.json.handlers().lookup(dir, &action).unwrap_or_else(not_for_us);
                let relay = RelayHandler::new(self.node_id.clone(), RouteMode::SourceRouted, self.json_next_hop())
                    .with_local(local)
                    .into_handler();
                self.json.handlers().register_handler(dir, action, relay);
            }
        }
    }

    /// Send a request of our own to a connected peer and wait for the answer
    pub async fn call(
        &self,
        target: &str,
        action: Action,
        payload: Value,
        cancel: CancellationToken,
    ) -> Result<Response<Value>, RelayError> {
        let path = NetworkPath::from_source(self.node_id.clone()).append(target);
        NextHop::<Action, Value>::relay(&self.peers, target, action, path, payload, cancel).await
    }

    /// Fail everything still waiting for an answer
    pub fn shutdown(&self) -> usize {
        let failed = self.json_outbound.fail_all() + self.binary_outbound.fail_all();
        if failed > 0 {
            info!(node = %self.node_id, failed, "Node shut down with requests in flight");
        }
        failed
    }

    /// Drop outbound requests sent over a connection that closed
    pub fn connection_closed(&self, connection: ConnectionHandle) -> usize {
        self.json_outbound.fail_connection(connection) + self.binary_outbound.fail_connection(connection)
    }

    fn json_next_hop(&self) -> Arc<dyn NextHop<Action, Value>> {
        Arc::new(self.peers.clone())
    }

    fn binary_next_hop(&self) -> Arc<dyn NextHop<Action, Vec<u8>>> {
        Arc::new(self.peers.clone())
    }
}

/// Report a frame that failed to decode; the fault code follows the kind
/// of failure (unknown action, unknown message type, malformed). The report
/// names the action when the frame still carries a recognisable one.
fn undecodable<P: Payload>(
    dispatcher: &Dispatcher<Action, P>,
    sender: &str,
    action: Option<Action>,
    message_id: Option<&str>,
    err: OcppError,
) -> Fault {
    let code = err.fault_code();
    let kind = action.map_or_else(|| "frame".to_string(), |a| a.to_string());
    let mut fault = dispatcher.decode_failure(&kind, message_id, sender, DecodeError::from(err));
    fault.code = code;
    fault
}

fn not_for_us<P: Payload>() -> Handler<Action, P> {
    handler_fn(|ctx: RequestContext<Action, P>| async move {
        Ok::<_, HandlerError>(Response::Error(Fault::new(
            FaultCode::NotImplemented,
            format!("{} is not handled by this networking node", ctx.kind),
        )))
    })
}

fn encode_text(message: &OcppMessage) -> Option<String> {
    match message.to_text() {
        Ok(text) => {
            debug!(message_id = message.message_id(), "Encoded reply");
            Some(text)
        }
        Err(e) => {
            error!(message_id = message.message_id(), error = %e, "Failed to encode reply");
            None
        }
    }
}

fn encode_binary(message: &BinaryMessage) -> Option<Vec<u8>> {
    match message.encode() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            error!(message_id = message.message_id(), error = %e, "Failed to encode reply");
            None
        }
    }
}
