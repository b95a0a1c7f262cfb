//! Local station model and reference handlers
//!
//! A networking node answers some requests itself: those addressed to the
//! node's own station model (Reset, DataTransfer on the way down) and, when
//! it runs without an uplink, the CSMS side of the station lifecycle
//! (BootNotification, Heartbeat, StatusNotification, DataTransfer on the
//! way up).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use netnode_core::{DecodeError, Direction, HandlerError, NodeId, RequestContext, Response};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::node::NetworkingNode;
use crate::ocpp::*;
use crate::typed::{on_request, JsonContext};

/// Vendor id the node answers binary transfers for
pub const VENDOR_ID: &str = "org.netnode";

/// Most EVSEs a simulated station carries
pub const MAX_EVSES: u32 = 1024;

/// State of one EVSE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvseState {
    pub evse_id: i32,
    pub connector_id: i32,
    pub status: ConnectorStatus,
    /// Reset accepted but not carried out yet
    pub pending_reset: Option<ResetType>,
}

impl EvseState {
    pub fn new(evse_id: i32, connector_id: i32) -> Self {
        Self {
            evse_id,
            connector_id,
            status: ConnectorStatus::Available,
            pending_reset: None,
        }
    }
}

/// The node's own charging station
#[derive(Debug)]
pub struct Station {
    pub station_id: String,
    pub vendor: String,
    pub model: String,
    pub firmware_version: Option<String>,

    /// EVSE states (evse_id -> state)
    pub evses: BTreeMap<i32, EvseState>,

    /// Whole-station reset accepted
    pub pending_reset: Option<ResetType>,

    /// Vendor data received through DataTransfer
    pub transfers: Vec<DataTransferRequest>,
}

impl Station {
    pub fn new(station_id: impl Into<String>) -> Self {
        Self {
            station_id: station_id.into(),
            vendor: "netnode".to_string(),
            model: "networking-node".to_string(),
            firmware_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            evses: BTreeMap::new(),
            pending_reset: None,
            transfers: Vec::new(),
        }
    }

    /// Station with EVSEs `1..=count`, one connector each; `count` is
    /// capped at `MAX_EVSES`
    pub fn with_evses(mut self, count: u32) -> Self {
        let last = i32::try_from(count.min(MAX_EVSES)).unwrap_or(0);
        for id in 1..=last {
            self.add_evse(id, 1);
        }
        self
    }

    pub fn add_evse(&mut self, evse_id: i32, connector_id: i32) {
        self.evses.insert(evse_id, EvseState::new(evse_id, connector_id));
    }

    pub fn evse(&self, evse_id: i32) -> Option<&EvseState> {
        self.evses.get(&evse_id)
    }

    pub fn charging_station_info(&self) -> ChargingStationInfo {
        ChargingStationInfo {
            model: self.model.clone(),
            vendor_name: self.vendor.clone(),
            serial_number: Some(self.station_id.clone()),
            firmware_version: self.firmware_version.clone(),
        }
    }

    /// Accept a reset of the whole station or of a known EVSE
    pub fn reset(&mut self, req: &ResetRequest) -> ResetResponse {
        match req.evse_id {
            None => {
                info!(station = %self.station_id, reset_type = ?req.reset_type, "Station reset accepted");
                self.pending_reset = Some(req.reset_type);
                ResetResponse {
                    status: ResetStatus::Accepted,
                    status_info: None,
                }
            }
            Some(evse_id) => match self.evses.get_mut(&evse_id) {
                Some(evse) => {
                    info!(station = %self.station_id, evse_id, reset_type = ?req.reset_type, "EVSE reset accepted");
                    evse.pending_reset = Some(req.reset_type);
                    ResetResponse {
                        status: ResetStatus::Accepted,
                        status_info: None,
                    }
                }
                None => {
                    warn!(station = %self.station_id, evse_id, "Reset for unknown EVSE");
                    ResetResponse {
                        status: ResetStatus::Rejected,
                        status_info: Some(
                            StatusInfo::new("UnknownEvse").with_info(format!("EVSE {} does not exist", evse_id)),
                        ),
                    }
                }
            },
        }
    }

    /// Record vendor data and echo it back
    pub fn data_transfer(&mut self, req: DataTransferRequest) -> DataTransferResponse {
        debug!(station = %self.station_id, vendor_id = %req.vendor_id, "DataTransfer received");
        let data = req.data.clone();
        self.transfers.push(req);
        DataTransferResponse {
            status: DataTransferStatus::Accepted,
            status_info: None,
            data,
        }
    }

    /// Echo binary data for our vendor id
    pub fn binary_data_transfer(&self, req: &BinaryDataTransferRequest) -> BinaryDataTransferResponse {
        if req.vendor_id != VENDOR_ID {
            return BinaryDataTransferResponse {
                status: DataTransferStatus::UnknownVendorId,
                data: Vec::new(),
            };
        }
        BinaryDataTransferResponse {
            status: DataTransferStatus::Accepted,
            data: req.data.clone(),
        }
    }
}

/// What the node knows about a station it answered BootNotification for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationRecord {
    pub info: ChargingStationInfo,
    pub booted_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Last reported status per (evse, connector)
    pub connectors: HashMap<(i32, i32), ConnectorStatus>,
}

/// Stations seen by a node acting as local CSMS endpoint
#[derive(Debug)]
pub struct StationDirectory {
    pub heartbeat_interval: i32,
    stations: HashMap<NodeId, StationRecord>,
}

impl StationDirectory {
    pub fn new(heartbeat_interval: i32) -> Self {
        Self {
            heartbeat_interval,
            stations: HashMap::new(),
        }
    }

    pub fn get(&self, station_id: &str) -> Option<&StationRecord> {
        self.stations.get(station_id)
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    pub fn boot(&mut self, station_id: &str, req: BootNotificationRequest) -> BootNotificationResponse {
        let now = Utc::now();
        info!(
            station = station_id,
            vendor = %req.charging_station.vendor_name,
            model = %req.charging_station.model,
            reason = ?req.reason,
            "Station booted"
        );
        self.stations.insert(
            station_id.to_string(),
            StationRecord {
                info: req.charging_station,
                booted_at: now,
                last_heartbeat: None,
                connectors: HashMap::new(),
            },
        );
        BootNotificationResponse {
            current_time: now,
            interval: self.heartbeat_interval,
            status: RegistrationStatus::Accepted,
            status_info: None,
        }
    }

    pub fn heartbeat(&mut self, station_id: &str) -> HeartbeatResponse {
        let now = Utc::now();
        match self.stations.get_mut(station_id) {
            Some(record) => record.last_heartbeat = Some(now),
            None => debug!(station = station_id, "Heartbeat before BootNotification"),
        }
        HeartbeatResponse { current_time: now }
    }

    pub fn status(&mut self, station_id: &str, req: &StatusNotificationRequest) -> StatusNotificationResponse {
        if let Some(record) = self.stations.get_mut(station_id) {
            record
                .connectors
                .insert((req.evse_id, req.connector_id), req.connector_status);
        }
        StatusNotificationResponse {}
    }
}

/// Originating station of a request travelling upward
fn originator(ctx: &JsonContext) -> NodeId {
    ctx.network_path.source().clone()
}

/// Register the SystemToDevice handlers answered by the node's own station
pub fn station_handlers(node: &NetworkingNode, station: Arc<RwLock<Station>>) {
    let handlers = node.json().handlers();
    let dir = Direction::SystemToDevice;

    let s = station.clone();
    handlers.register_handler(
        dir,
        Action::Reset,
        on_request(move |req: ResetRequest, _ctx| {
            let s = s.clone();
            async move { Ok::<_, HandlerError>(s.write().await.reset(&req)) }
        }),
    );

    let s = station.clone();
    handlers.register_handler(
        dir,
        Action::DataTransfer,
        on_request(move |req: DataTransferRequest, _ctx| {
            let s = s.clone();
            async move { Ok::<_, HandlerError>(s.write().await.data_transfer(req)) }
        }),
    );

    let s = station;
    node.binary().handlers().register(
        dir,
        Action::BinaryDataTransfer,
        move |ctx: RequestContext<Action, Vec<u8>>| {
            let s = s.clone();
            async move {
                let req = BinaryDataTransferRequest::decode(&ctx.request).map_err(DecodeError::from)?;
                let res = s.read().await.binary_data_transfer(&req);
                Ok(Response::Result(res.encode()))
            }
        },
    );
}

/// Register the DeviceToSystem handlers of a node answering as the CSMS
pub fn csms_handlers(node: &NetworkingNode, directory: Arc<RwLock<StationDirectory>>) {
    let handlers = node.json().handlers();
    let dir = Direction::DeviceToSystem;

    let d = directory.clone();
    handlers.register_handler(
        dir,
        Action::BootNotification,
        on_request(move |req: BootNotificationRequest, ctx| {
            let d = d.clone();
            async move { Ok::<_, HandlerError>(d.write().await.boot(&originator(&ctx), req)) }
        }),
    );

    let d = directory.clone();
    handlers.register_handler(
        dir,
        Action::Heartbeat,
        on_request(move |_req: HeartbeatRequest, ctx| {
            let d = d.clone();
            async move { Ok::<_, HandlerError>(d.write().await.heartbeat(&originator(&ctx))) }
        }),
    );

    let d = directory;
    handlers.register_handler(
        dir,
        Action::StatusNotification,
        on_request(move |req: StatusNotificationRequest, ctx| {
            let d = d.clone();
            async move { Ok::<_, HandlerError>(d.write().await.status(&originator(&ctx), &req)) }
        }),
    );

    handlers.register_handler(
        dir,
        Action::DataTransfer,
        on_request(|req: DataTransferRequest, _ctx| async move {
            Ok::<_, HandlerError>(DataTransferResponse {
                status: DataTransferStatus::Accepted,
                status_info: None,
                data: req.data,
            })
        }),
    );
}
