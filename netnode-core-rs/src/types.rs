//! Core types shared across the dispatch pipeline

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a node (charging station, networking node or CSMS)
pub type NodeId = String;

/// Boxed error used at the handler and subscriber seams
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Anything usable as a message kind selector.
///
/// Implemented for every type that can key a hash map and be printed,
/// so protocol bindings only need to provide their action enum.
pub trait MessageKind: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

impl<T> MessageKind for T where T: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

/// Anything usable as a decoded request or response body.
pub trait Payload: Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> Payload for T where T: Clone + fmt::Debug + Send + Sync + 'static {}

/// Direction a message travels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Charging station (or downstream node) towards the CSMS
    DeviceToSystem,
    /// CSMS (or upstream node) towards the charging station
    SystemToDevice,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::DeviceToSystem => Direction::SystemToDevice,
            Direction::SystemToDevice => Direction::DeviceToSystem,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::DeviceToSystem => write!(f, "device->system"),
            Direction::SystemToDevice => write!(f, "system->device"),
        }
    }
}

/// Opaque handle of the transport connection a message arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionHandle(u64);

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

impl ConnectionHandle {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocate a process-unique handle
    pub fn next() -> Self {
        Self(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// RPC framework error codes carried by synthetic error responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
}

impl FaultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultCode::FormatViolation => "FormatViolation",
            FaultCode::GenericError => "GenericError",
            FaultCode::InternalError => "InternalError",
            FaultCode::MessageTypeNotSupported => "MessageTypeNotSupported",
            FaultCode::NotImplemented => "NotImplemented",
            FaultCode::NotSupported => "NotSupported",
            FaultCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            FaultCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            FaultCode::ProtocolError => "ProtocolError",
            FaultCode::RpcFrameworkError => "RpcFrameworkError",
            FaultCode::SecurityError => "SecurityError",
            FaultCode::TypeConstraintViolation => "TypeConstraintViolation",
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a known fault code
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown fault code: {0}")]
pub struct UnknownFaultCode(pub String);

impl FromStr for FaultCode {
    type Err = UnknownFaultCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = match s {
            "FormatViolation" => FaultCode::FormatViolation,
            "GenericError" => FaultCode::GenericError,
            "InternalError" => FaultCode::InternalError,
            "MessageTypeNotSupported" => FaultCode::MessageTypeNotSupported,
            "NotImplemented" => FaultCode::NotImplemented,
            "NotSupported" => FaultCode::NotSupported,
            "OccurrenceConstraintViolation" => FaultCode::OccurrenceConstraintViolation,
            // 1.6 peers still send the misspelled form
            "OccurenceConstraintViolation" => FaultCode::OccurrenceConstraintViolation,
            "PropertyConstraintViolation" => FaultCode::PropertyConstraintViolation,
            "ProtocolError" => FaultCode::ProtocolError,
            "RpcFrameworkError" => FaultCode::RpcFrameworkError,
            "SecurityError" => FaultCode::SecurityError,
            "TypeConstraintViolation" => FaultCode::TypeConstraintViolation,
            other => return Err(UnknownFaultCode(other.to_string())),
        };
        Ok(code)
    }
}

/// Protocol-level error response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    pub code: FaultCode,
    pub description: String,
    pub details: serde_json::Value,
}

impl Fault {
    pub fn new(code: FaultCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.description)
    }
}

/// Final answer to a request: a result payload or a protocol-level error
#[derive(Debug, Clone, PartialEq)]
pub enum Response<P> {
    Result(P),
    Error(Fault),
}

impl<P> Response<P> {
    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error(_))
    }

    pub fn result(&self) -> Option<&P> {
        match self {
            Response::Result(p) => Some(p),
            Response::Error(_) => None,
        }
    }

    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Response::Result(_) => None,
            Response::Error(f) => Some(f),
        }
    }

    pub fn map<Q>(self, f: impl FnOnce(P) -> Q) -> Response<Q> {
        match self {
            Response::Result(p) => Response::Result(f(p)),
            Response::Error(fault) => Response::Error(fault),
        }
    }
}

impl<P> From<Fault> for Response<P> {
    fn from(fault: Fault) -> Self {
        Response::Error(fault)
    }
}
