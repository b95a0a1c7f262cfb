//! Configuration for a networking node
//!
//! Combines the dispatch settings of the core with the OCPP transport:
//! where stations connect, and the optional uplink towards a CSMS.

use netnode_core::{DispatchConfig, IntermediaryRoles};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use crate::station::MAX_EVSES;

/// OCPP 2.0.1 WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp2.0.1";

/// Invalid configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("node id must not be empty")]
    EmptyNodeId,

    #[error("uplink URL must start with ws:// or wss://, got {0}")]
    InvalidUplinkUrl(String),

    #[error("initial reconnect delay {initial:?} exceeds maximum {max:?}")]
    ReconnectDelays { initial: Duration, max: Duration },

    #[error("station needs at least one EVSE")]
    NoEvses,

    #[error("station supports at most {max} EVSEs, got {count}")]
    TooManyEvses { count: u32, max: u32 },
}

/// Complete node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    // Node identity
    pub node_id: String,

    /// Address charging stations connect to
    pub listen_addr: SocketAddr,

    /// Connection towards the CSMS; without one the node answers
    /// station requests itself
    pub uplink: Option<UplinkConfig>,

    /// How long relayed requests wait for the next hop
    pub relay_timeout: Duration,

    pub dispatch: DispatchConfig,

    pub station: StationConfig,
}

/// Uplink (CSMS) connection
#[derive(Debug, Clone)]
pub struct UplinkConfig {
    /// CSMS WebSocket URL (without node ID)
    pub csms_url: String,

    /// Name the CSMS is known by on network paths
    pub csms_id: String,

    pub subprotocol: String,

    /// Initial reconnect delay
    pub reconnect_delay: Duration,

    /// Maximum reconnect delay (exponential backoff cap)
    pub max_reconnect_delay: Duration,

    /// Request timeout
    pub request_timeout: Duration,
}

/// The node's own station model
#[derive(Debug, Clone)]
pub struct StationConfig {
    /// Number of EVSEs to report
    pub evse_count: u32,

    /// Heartbeat interval handed out when answering BootNotification locally
    pub heartbeat_interval: i32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "networking-node".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            uplink: None,
            relay_timeout: Duration::from_secs(30),
            dispatch: DispatchConfig::new("networking-node"),
            station: StationConfig::default(),
        }
    }
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            csms_url: "ws://localhost:8180/steve/websocket/CentralSystemService".to_string(),
            csms_id: "CSMS".to_string(),
            subprotocol: OCPP_SUBPROTOCOL.to_string(),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            evse_count: 1,
            heartbeat_interval: 300,
        }
    }
}

impl UplinkConfig {
    pub fn new(csms_url: impl Into<String>) -> Self {
        Self {
            csms_url: csms_url.into(),
            ..Default::default()
        }
    }

    /// URL the node connects to: the CSMS URL followed by the node id
    pub fn endpoint(&self, node_id: &str) -> String {
        format!("{}/{}", self.csms_url.trim_end_matches('/'), node_id)
    }
}

impl NodeConfig {
    /// Create config with basic parameters
    pub fn new(node_id: impl Into<String>, listen_addr: SocketAddr) -> Self {
        let node_id = node_id.into();

        Self {
            dispatch: DispatchConfig::new(node_id.clone()),
            node_id,
            listen_addr,
            ..Default::default()
        }
    }

    /// Connect upward to a CSMS
    pub fn with_uplink(mut self, uplink: UplinkConfig) -> Self {
        self.uplink = Some(uplink);
        self
    }

    /// Set EVSE count
    pub fn with_evse_count(mut self, count: u32) -> Self {
        self.station.evse_count = count;
        self
    }

    pub fn with_relay_timeout(mut self, timeout: Duration) -> Self {
        self.relay_timeout = timeout;
        self
    }

    pub fn with_decide_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch = self.dispatch.with_decide_timeout(timeout);
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.dispatch = self.dispatch.with_handler_timeout(timeout);
        self
    }

    pub fn with_subscriber_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch = self.dispatch.with_subscriber_timeout(timeout);
        self
    }

    pub fn with_intermediary(mut self, roles: IntermediaryRoles) -> Self {
        self.dispatch = self.dispatch.with_intermediary(roles);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::EmptyNodeId);
        }
        if self.station.evse_count == 0 {
            return Err(ConfigError::NoEvses);
        }
        if self.station.evse_count > MAX_EVSES {
            return Err(ConfigError::TooManyEvses {
                count: self.station.evse_count,
                max: MAX_EVSES,
            });
        }
        if let Some(uplink) = &self.uplink {
            if !(uplink.csms_url.starts_with("ws://") || uplink.csms_url.starts_with("wss://")) {
                return Err(ConfigError::InvalidUplinkUrl(uplink.csms_url.clone()));
            }
            if uplink.reconnect_delay > uplink.max_reconnect_delay {
                return Err(ConfigError::ReconnectDelays {
                    initial: uplink.reconnect_delay,
                    max: uplink.max_reconnect_delay,
                });
            }
        }
        Ok(())
    }
}
