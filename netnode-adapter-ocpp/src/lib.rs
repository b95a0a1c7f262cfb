//! # Networking node OCPP adapter
//!
//! OCPP 2.0.1 binding for the networking node dispatch core.
//!
//! A networking node sits between charging stations and a CSMS. Every
//! request passing through it is observed, may be rejected or answered by
//! a forwarding policy, and is otherwise handled locally or relayed to the
//! next hop.
//!
//! ## Architecture
//!
//! ```text
//! OCPP CSMS (Backend)
//!       │ WebSocket (uplink)
//!       ▼
//! ┌──────────────────────────────────────┐
//! │    netnode-adapter-ocpp              │
//! │  ┌───────────┐   ┌────────────────┐  │
//! │  │ Codec     │◄─►│ NetworkingNode │  │
//! │  │ JSON/bin  │   │ 2x Dispatcher  │  │
//! │  └───────────┘   └────────────────┘  │
//! └─────────────┬────────────────────────┘
//!               │ WebSocket (station-facing)
//!               ▼
//!       Charging stations
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use netnode_adapter_ocpp::{policy, NetworkingNode, NodeConfig, UplinkConfig};
//! use netnode_core::{Direction, TracingErrorSink};
//! use netnode_adapter_ocpp::ocpp::Action;
//!
//! let config = NodeConfig::new("nn-1", "0.0.0.0:9000".parse().unwrap())
//!     .with_uplink(UplinkConfig::new("ws://csms.local/ocpp"));
//! let node = NetworkingNode::new(&config, Arc::new(TracingErrorSink));
//!
//! node.relay_upward("CSMS");
//! node.json().forwarding().register_decision(
//!     Direction::DeviceToSystem,
//!     Action::DataTransfer,
//!     policy::reject_data_transfer("Please REJECT!"),
//! );
//! ```

pub mod config;
pub mod connection;
pub mod node;
pub mod ocpp;
pub mod policy;
pub mod station;
pub mod typed;

pub use config::{ConfigError, NodeConfig, StationConfig, UplinkConfig, OCPP_SUBPROTOCOL};
pub use connection::{serve_station, station_id_from_path, Outgoing, PeerConnection, PeerRegistry, Uplink};
pub use node::{NetworkingNode, PeerRole};
pub use station::{csms_handlers, station_handlers, Station, StationDirectory};
pub use typed::{decide_on, on_request, to_response, JsonContext};

// Re-export key types
pub use ocpp::{Action, BinaryMessage, Call, CallError, CallResult, OcppError, OcppMessage};
