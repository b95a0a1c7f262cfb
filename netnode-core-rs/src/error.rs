//! Error taxonomy of the dispatch pipeline

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::path::PathError;
use crate::types::{BoxError, Direction, Fault, FaultCode, NodeId};

/// Category of an error report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    Decode,
    UnhandledMessageKind,
    HandlerFailure,
    HandlerTimeout,
    ForwardingTimeout,
    Cancelled,
    AlreadyCompleted,
    SubscriberFailure,
    RelayFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Malformed wire data or a payload that does not match its schema
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DecodeError(pub String);

impl DecodeError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

/// Second completion of an exchange
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    #[error("exchange {correlation_id} already completed")]
    AlreadyCompleted { correlation_id: String },
}

/// What a handler may fail with
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("payload decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("relay failed: {0}")]
    Relay(#[from] RelayError),

    #[error("{0}")]
    Failed(BoxError),
}

impl HandlerError {
    pub fn failed(err: impl Into<BoxError>) -> Self {
        HandlerError::Failed(err.into())
    }
}

/// Failures relaying a request to the next hop
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("no response from next hop within {0:?}")]
    Timeout(Duration),

    #[error("relay cancelled")]
    Cancelled,

    #[error("connection to next hop closed")]
    ConnectionClosed,

    #[error("next hop {0} is not connected")]
    UnknownPeer(NodeId),

    #[error("network path: {0}")]
    Path(#[from] PathError),

    #[error("failed to encode relayed request: {0}")]
    Encode(String),
}

/// Failures that the dispatch orchestrator converts into synthetic responses
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("no handler registered for {kind} ({direction})")]
    UnhandledMessageKind { kind: String, direction: Direction },

    #[error("handler failed: {0}")]
    HandlerFailure(String),

    #[error("handler did not answer within {0:?}")]
    HandlerTimeout(Duration),

    #[error("forwarding decision did not answer within {0:?}")]
    ForwardingTimeout(Duration),

    #[error("request cancelled")]
    Cancelled,

    #[error("relay failed: {0}")]
    RelayFailure(RelayError),

    #[error(transparent)]
    AlreadyCompleted(#[from] ExchangeError),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Decode(_) => ErrorKind::Decode,
            DispatchError::UnhandledMessageKind { .. } => ErrorKind::UnhandledMessageKind,
            DispatchError::HandlerFailure(_) => ErrorKind::HandlerFailure,
            DispatchError::HandlerTimeout(_) => ErrorKind::HandlerTimeout,
            DispatchError::ForwardingTimeout(_) => ErrorKind::ForwardingTimeout,
            DispatchError::Cancelled => ErrorKind::Cancelled,
            DispatchError::RelayFailure(_) => ErrorKind::RelayFailure,
            DispatchError::AlreadyCompleted(_) => ErrorKind::AlreadyCompleted,
        }
    }

    /// Protocol-level error response sent to the remote peer
    pub fn to_fault(&self) -> Fault {
        match self {
            DispatchError::Decode(e) => Fault::new(FaultCode::FormatViolation, e.to_string()),
            DispatchError::UnhandledMessageKind { kind, .. } => Fault::new(
                FaultCode::NotImplemented,
                format!("{} is not supported by this node", kind),
            ),
            DispatchError::HandlerFailure(_) | DispatchError::AlreadyCompleted(_) => {
                Fault::new(FaultCode::InternalError, "Internal error while processing request")
            }
            DispatchError::RelayFailure(e) => Fault::new(
                FaultCode::InternalError,
                format!("Could not relay request: {}", e),
            ),
            DispatchError::HandlerTimeout(_) => Fault::new(FaultCode::GenericError, "Handler timeout"),
            DispatchError::ForwardingTimeout(_) => {
                Fault::new(FaultCode::GenericError, "Forwarding timeout")
            }
            DispatchError::Cancelled => Fault::new(FaultCode::GenericError, "Request cancelled"),
        }
    }
}

impl From<HandlerError> for DispatchError {
    fn from(e: HandlerError) -> Self {
        match e {
            HandlerError::Decode(d) => DispatchError::Decode(d),
            HandlerError::Relay(r) => DispatchError::RelayFailure(r),
            HandlerError::Failed(err) => DispatchError::HandlerFailure(err.to_string()),
        }
    }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
