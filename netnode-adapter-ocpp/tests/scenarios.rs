//! End-to-end scenarios driving a `NetworkingNode` with wire frames

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use netnode_adapter_ocpp::ocpp::{
    Action, BinaryDataTransferRequest, BinaryDataTransferResponse, BinaryMessage, DataTransferStatus, OcppMessage,
};
use netnode_adapter_ocpp::{
    csms_handlers, on_request, policy, serve_station, station, station_handlers, NetworkingNode, NodeConfig,
    Outgoing, PeerRole, Station, StationDirectory,
};
use netnode_core::{BoxError, ConnectionHandle, Direction, ErrorKind, EventPhase, MemoryErrorSink, Response};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const STATION: ConnectionHandle = ConnectionHandle::new(1);
const UPSTREAM: ConnectionHandle = ConnectionHandle::new(2);

fn node(id: &str) -> (NetworkingNode, Arc<MemoryErrorSink>) {
    let sink = Arc::new(MemoryErrorSink::new());
    let config = NodeConfig::new(id, SocketAddr::from(([127, 0, 0, 1], 0)))
        .with_evse_count(2)
        .with_relay_timeout(Duration::from_secs(2));
    (NetworkingNode::new(&config, sink.clone()), sink)
}

fn with_station(node: &NetworkingNode) -> Arc<RwLock<Station>> {
    let station = Arc::new(RwLock::new(Station::new(node.node_id()).with_evses(2)));
    station_handlers(node, station.clone());
    station
}

async fn from_station(node: &NetworkingNode, frame: Value) -> Value {
    let reply = node
        .handle_text(&frame.to_string(), "cs-1", PeerRole::Station, STATION, CancellationToken::new())
        .await
        .expect("reply");
    serde_json::from_str(&reply).unwrap()
}

async fn from_csms(node: &NetworkingNode, frame: Value) -> Value {
    let reply = node
        .handle_text(&frame.to_string(), "CSMS", PeerRole::Upstream, UPSTREAM, CancellationToken::new())
        .await
        .expect("reply");
    serde_json::from_str(&reply).unwrap()
}

fn failing_subscriber() -> Result<(), BoxError> {
    Err("subscriber failed".into())
}

#[tokio::test]
async fn scenario_a_whole_station_reset_is_accepted() {
    let (node, _sink) = node("nn-1");
    with_station(&node);

    let reply = from_csms(&node, json!([2, "r-1", "Reset", {"type": "Immediate"}])).await;
    assert_eq!(reply, json!([3, "r-1", {"status": "Accepted"}]));
}

#[tokio::test]
async fn scenario_b_unknown_evse_reset_is_rejected() {
    let (node, _sink) = node("nn-1");
    let station = with_station(&node);

    let reply = from_csms(&node, json!([2, "r-2", "Reset", {"type": "Immediate", "evseId": 9}])).await;
    assert_eq!(reply[2]["status"], "Rejected");
    assert_eq!(reply[2]["statusInfo"]["reasonCode"], "UnknownEvse");

    let known = from_csms(&node, json!([2, "r-3", "Reset", {"type": "OnIdle", "evseId": 2}])).await;
    assert_eq!(known[2]["status"], "Accepted");
    assert!(station.read().await.evse(2).unwrap().pending_reset.is_some());
}

#[tokio::test]
async fn scenario_c_reject_literal_skips_handler() {
    let (node, _sink) = node("nn-1");
    let calls = Arc::new(AtomicUsize::new(0));

    let spy = calls.clone();
    node.json().handlers().register_handler(
        Direction::DeviceToSystem,
        Action::DataTransfer,
        on_request(move |req: netnode_adapter_ocpp::ocpp::DataTransferRequest, _ctx| {
            let spy = spy.clone();
            async move {
                spy.fetch_add(1, Ordering::SeqCst);
                Ok(netnode_adapter_ocpp::ocpp::DataTransferResponse {
                    status: DataTransferStatus::Accepted,
                    status_info: None,
                    data: req.data,
                })
            }
        }),
    );
    node.json().forwarding().register_decision(
        Direction::DeviceToSystem,
        Action::DataTransfer,
        policy::reject_data_transfer("Please REJECT!"),
    );

    let rejected = from_station(
        &node,
        json!([2, "d-1", "DataTransfer", {"vendorId": "com.example", "data": "Please REJECT!"}]),
    )
    .await;
    assert_eq!(rejected[0], 3);
    assert_eq!(rejected[2]["status"], "Rejected");
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let forwarded = from_station(
        &node,
        json!([2, "d-2", "DataTransfer", {"vendorId": "com.example", "data": "hello"}]),
    )
    .await;
    assert_eq!(forwarded, json!([3, "d-2", {"status": "Accepted", "data": "hello"}]));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let stats = node.json().stats();
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.handled, 1);
}

#[tokio::test]
async fn scenario_d_boot_notification_reaches_handler() {
    let (node, _sink) = node("nn-1");
    let directory = Arc::new(RwLock::new(StationDirectory::new(300)));
    csms_handlers(&node, directory.clone());

    assert!(!node
        .json()
        .forwarding()
        .contains(Direction::DeviceToSystem, &Action::BootNotification));

    let reply = from_station(
        &node,
        json!([2, "b-1", "BootNotification", {
            "chargingStation": {"model": "EK3", "vendorName": "Elektrokombinacija"},
            "reason": "PowerUp"
        }]),
    )
    .await;
    assert_eq!(reply[2]["status"], "Accepted");
    assert_eq!(reply[2]["interval"], 300);
    assert!(directory.read().await.get("cs-1").is_some());
}

#[tokio::test]
async fn scenario_e_failing_subscriber_is_isolated() {
    let (node, sink) = node("nn-1");
    csms_handlers(&node, Arc::new(RwLock::new(StationDirectory::new(300))));

    let first = Arc::new(AtomicUsize::new(0));
    let third = Arc::new(AtomicUsize::new(0));
    let events = node.json().events();

    let counter = first.clone();
    events.subscribe(Action::Heartbeat, EventPhase::ResponseObserved, move |_event| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, BoxError>(()) }
    });
    events.subscribe(Action::Heartbeat, EventPhase::ResponseObserved, |_event| async {
        failing_subscriber()
    });
    let counter = third.clone();
    events.subscribe(Action::Heartbeat, EventPhase::ResponseObserved, move |_event| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, BoxError>(()) }
    });

    let reply = from_station(&node, json!([2, "h-1", "Heartbeat", {}])).await;
    assert_eq!(reply[0], 3);
    assert!(reply[2]["currentTime"].is_string());

    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(third.load(Ordering::SeqCst), 1);
    assert_eq!(sink.count(ErrorKind::SubscriberFailure), 1);
    assert_eq!(node.json().stats().subscriber_failures, 1);
}

#[tokio::test]
async fn upward_relay_records_path_and_returns_answer() {
    let (node, _sink) = node("nn-1");
    node.relay_upward("CSMS");

    let (tx, mut csms) = mpsc::channel(4);
    node.peers().register("CSMS", UPSTREAM, PeerRole::Upstream, tx);

    let relaying = node.clone();
    let station_side = tokio::spawn(async move {
        from_station(&relaying, json!([2, "s-1", "Heartbeat", {}])).await
    });

    let relayed = match csms.recv().await.unwrap() {
        Outgoing::Text(frame) => OcppMessage::parse(frame.as_bytes()).unwrap(),
        other => panic!("expected text frame, got {:?}", other),
    };
    let path = relayed.network_path().unwrap();
    assert_eq!(path.hops(), &["cs-1".to_string(), "nn-1".to_string()]);

    let answer = json!([3, relayed.message_id(), {"currentTime": "2026-01-01T00:00:00Z"}]);
    assert!(node
        .handle_text(&answer.to_string(), "CSMS", PeerRole::Upstream, UPSTREAM, CancellationToken::new())
        .await
        .is_none());

    let reply = station_side.await.unwrap();
    assert_eq!(reply, json!([3, "s-1", {"currentTime": "2026-01-01T00:00:00Z"}]));
}

#[tokio::test]
async fn downward_relay_follows_planned_path() {
    let (node, _sink) = node("nn-1");
    with_station(&node);
    node.relay_downward();

    let (tx, mut station_rx) = mpsc::channel(4);
    node.peers().register("cs-7", STATION, PeerRole::Station, tx);

    // Path ends here: answered by the node's own station
    let local = from_csms(&node, json!([2, "l-1", "Reset", {"type": "Immediate"}, {"networkPath": ["nn-1"]}])).await;
    assert_eq!(local, json!([3, "l-1", {"status": "Accepted"}]));

    let relaying = node.clone();
    let csms_side = tokio::spawn(async move {
        from_csms(
            &relaying,
            json!([2, "l-2", "Reset", {"type": "Immediate"}, {"networkPath": ["nn-1", "cs-7"]}]),
        )
        .await
    });

    let relayed = match station_rx.recv().await.unwrap() {
        Outgoing::Text(frame) => OcppMessage::parse(frame.as_bytes()).unwrap(),
        other => panic!("expected text frame, got {:?}", other),
    };
    assert_eq!(relayed.network_path().unwrap().hops(), &["cs-7".to_string()]);

    let answer = json!([4, relayed.message_id(), "NotSupported", "no reset here", {}]);
    node.handle_text(&answer.to_string(), "cs-7", PeerRole::Station, STATION, CancellationToken::new())
        .await;

    let reply = csms_side.await.unwrap();
    assert_eq!(reply, json!([4, "l-2", "NotSupported", "no reset here", {}]));
}

#[tokio::test]
async fn relay_to_missing_peer_is_internal_error() {
    let (node, sink) = node("nn-1");
    node.relay_upward("CSMS");

    let reply = from_station(&node, json!([2, "m-1", "Heartbeat", {}])).await;
    assert_eq!(reply[0], 4);
    assert_eq!(reply[2], "InternalError");
    assert_eq!(sink.count(ErrorKind::RelayFailure), 1);
}

#[tokio::test]
async fn abandoned_relay_forgets_pending_request() {
    let sink = Arc::new(MemoryErrorSink::new());
    let config = NodeConfig::new("nn-1", SocketAddr::from(([127, 0, 0, 1], 0)))
        .with_relay_timeout(Duration::from_secs(30))
        .with_handler_timeout(Some(Duration::from_millis(50)));
    let node = NetworkingNode::new(&config, sink.clone());
    node.relay_upward("CSMS");

    // The CSMS stays connected but never answers
    let (tx, mut csms) = mpsc::channel(4);
    node.peers().register("CSMS", UPSTREAM, PeerRole::Upstream, tx);

    let timed_out = from_station(&node, json!([2, "t-1", "Heartbeat", {}])).await;
    assert_eq!(timed_out[0], 4);
    assert_eq!(timed_out[2], "GenericError");
    assert_eq!(timed_out[3], "Handler timeout");
    assert!(csms.recv().await.is_some());
    assert_eq!(node.pending_requests(), 0);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });
    let reply = node
        .handle_text(&json!([2, "t-2", "Heartbeat", {}]).to_string(), "cs-1", PeerRole::Station, STATION, cancel)
        .await
        .expect("reply");
    let cancelled: Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(cancelled[0], 4);
    assert_eq!(cancelled[3], "Request cancelled");
    assert!(csms.recv().await.is_some());
    assert_eq!(node.pending_requests(), 0);
    assert_eq!(sink.count(ErrorKind::HandlerTimeout), 1);
}

#[tokio::test]
async fn malformed_call_is_reported_under_its_action() {
    let (node, sink) = node("nn-1");
    with_station(&node);

    // Recognised action, frame of the wrong shape
    let reply = from_station(&node, json!([2, "f-1", "Heartbeat"])).await;
    assert_eq!(reply[0], 4);
    assert_eq!(reply[1], "f-1");

    let reports = sink.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].kind, ErrorKind::Decode);
    assert_eq!(reports[0].message_kind, "Heartbeat");

    // Nothing to recover the action from
    from_station(&node, json!([2, "f-2", "NoSuchAction", {}])).await;
    let reports = sink.reports();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[1].message_kind, "frame");
}

#[tokio::test]
async fn binary_data_transfer_is_answered_locally() {
    let (node, _sink) = node("nn-1");
    with_station(&node);

    let body = BinaryDataTransferRequest {
        vendor_id: station::VENDOR_ID.to_string(),
        message_id: None,
        data: vec![1, 2, 3, 4],
    };
    let frame = BinaryMessage::Call {
        message_id: "bin-1".to_string(),
        action: Action::BinaryDataTransfer,
        network_path: None,
        payload: body.encode().unwrap(),
    }
    .encode()
    .unwrap();

    let reply = node
        .handle_binary(&frame, "CSMS", PeerRole::Upstream, UPSTREAM, CancellationToken::new())
        .await
        .unwrap();
    let (id, response) = BinaryMessage::decode(&reply).unwrap().into_response().unwrap();
    assert_eq!(id, "bin-1");
    let body = match response {
        Response::Result(bytes) => BinaryDataTransferResponse::decode(&bytes).unwrap(),
        Response::Error(fault) => panic!("unexpected fault {}", fault),
    };
    assert_eq!(body.status, DataTransferStatus::Accepted);
    assert_eq!(body.data, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn truncated_binary_frame_is_format_violation() {
    let (node, sink) = node("nn-1");
    let frame = BinaryMessage::Call {
        message_id: "bin-2".to_string(),
        action: Action::BinaryDataTransfer,
        network_path: None,
        payload: vec![0; 8],
    }
    .encode()
    .unwrap();

    let reply = node
        .handle_binary(&frame[..frame.len() - 3], "cs-1", PeerRole::Station, STATION, CancellationToken::new())
        .await
        .unwrap();
    let (id, response) = BinaryMessage::decode(&reply).unwrap().into_response().unwrap();
    assert_eq!(id, "bin-2");
    assert_eq!(response.fault().unwrap().code, netnode_core::FaultCode::FormatViolation);
    assert_eq!(sink.count(ErrorKind::Decode), 1);
    assert_eq!(sink.reports()[0].message_kind, "BinaryDataTransfer");
}

#[tokio::test]
async fn websocket_station_round_trip() {
    let (node, _sink) = node("nn-1");
    csms_handlers(&node, Arc::new(RwLock::new(StationDirectory::new(60))));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let shutdown = CancellationToken::new();

    let serving = node.clone();
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let _ = serve_station(stream, serving, server_shutdown).await;
    });

    let mut request = format!("ws://127.0.0.1:{}/ocpp/cs-ws", port)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("ocpp2.0.1"));
    let (mut ws, response) = tokio_tungstenite::connect_async(request).await.unwrap();
    assert_eq!(
        response.headers().get(header::SEC_WEBSOCKET_PROTOCOL).unwrap(),
        "ocpp2.0.1"
    );

    let boot = json!([2, "ws-1", "BootNotification", {
        "chargingStation": {"model": "EK3", "vendorName": "Elektrokombinacija"},
        "reason": "PowerUp"
    }]);
    ws.send(Message::Text(boot.to_string())).await.unwrap();

    let reply = loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => break serde_json::from_str::<Value>(&text).unwrap(),
            _ => continue,
        }
    };
    assert_eq!(reply[1], "ws-1");
    assert_eq!(reply[2]["status"], "Accepted");
    assert_eq!(reply[2]["interval"], 60);
    assert!(node.peers().contains("cs-ws"));

    ws.close(None).await.unwrap();
    shutdown.cancel();
}
