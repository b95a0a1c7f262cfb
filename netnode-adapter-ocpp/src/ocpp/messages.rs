//! OCPP-J message framing
//!
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! A networking node may append one more element to any frame,
//! `{"networkPath": [...]}`, naming the hops the message has taken (upward)
//! or still has to take (downward).

use netnode_core::{DecodeError, Fault, FaultCode, NetworkPath, PathError, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::action::Action;

const NETWORK_PATH_KEY: &str = "networkPath";

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    pub fn from_code(code: i64) -> Result<Self, OcppError> {
        match code {
            2 => Ok(MessageType::Call),
            3 => Ok(MessageType::CallResult),
            4 => Ok(MessageType::CallError),
            other => Err(OcppError::UnknownMessageType(other)),
        }
    }
}

/// Errors in OCPP framing and transport
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid message format: {0}")]
    InvalidFormat(&'static str),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("Invalid network path: {0}")]
    Path(#[from] PathError),

    #[error("Frame truncated")]
    Truncated,

    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),

    #[error("Invalid UTF-8 in frame")]
    InvalidUtf8,

    #[error("Field too long for frame: {0} bytes")]
    FieldTooLong(usize),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,
}

impl OcppError {
    /// RPC error code answered to a peer whose frame failed to decode
    pub fn fault_code(&self) -> FaultCode {
        match self {
            OcppError::UnknownAction(_) => FaultCode::NotImplemented,
            OcppError::UnknownMessageType(_) => FaultCode::MessageTypeNotSupported,
            _ => FaultCode::FormatViolation,
        }
    }
}

impl From<OcppError> for DecodeError {
    fn from(e: OcppError) -> Self {
        DecodeError::new(e.to_string())
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: Action,
    pub payload: Value,
    pub network_path: Option<NetworkPath>,
}

impl Call {
    /// Create a new CALL message with auto-generated ID
    pub fn new(action: Action, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            action,
            payload: serde_json::to_value(payload)?,
            network_path: None,
        })
    }

    pub fn with_network_path(mut self, path: NetworkPath) -> Self {
        self.network_path = Some(path);
        self
    }

    fn to_value(&self) -> Value {
        with_path(
            vec![
                Value::from(MessageType::Call as i32),
                Value::from(self.message_id.as_str()),
                Value::from(self.action.as_str()),
                self.payload.clone(),
            ],
            &self.network_path,
        )
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
    pub network_path: Option<NetworkPath>,
}

impl CallResult {
    pub fn new(message_id: impl Into<String>, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: message_id.into(),
            payload: serde_json::to_value(payload)?,
            network_path: None,
        })
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    fn to_value(&self) -> Value {
        with_path(
            vec![
                Value::from(MessageType::CallResult as i32),
                Value::from(self.message_id.as_str()),
                self.payload.clone(),
            ],
            &self.network_path,
        )
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: FaultCode,
    pub error_description: String,
    pub error_details: Value,
    pub network_path: Option<NetworkPath>,
}

impl CallError {
    pub fn new(message_id: impl Into<String>, error_code: FaultCode, error_description: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
            network_path: None,
        }
    }

    pub fn from_fault(message_id: impl Into<String>, fault: &Fault) -> Self {
        Self {
            message_id: message_id.into(),
            error_code: fault.code,
            error_description: fault.description.clone(),
            error_details: fault.details.clone(),
            network_path: None,
        }
    }

    pub fn to_fault(&self) -> Fault {
        Fault::new(self.error_code, self.error_description.clone()).with_details(self.error_details.clone())
    }

    fn to_value(&self) -> Value {
        with_path(
            vec![
                Value::from(MessageType::CallError as i32),
                Value::from(self.message_id.as_str()),
                Value::from(self.error_code.as_str()),
                Value::from(self.error_description.as_str()),
                self.error_details.clone(),
            ],
            &self.network_path,
        )
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Frame answering `message_id` with a dispatch response
    pub fn from_response(message_id: impl Into<String>, response: &Response<Value>) -> Self {
        match response {
            Response::Result(payload) => OcppMessage::CallResult(CallResult {
                message_id: message_id.into(),
                payload: payload.clone(),
                network_path: None,
            }),
            Response::Error(fault) => OcppMessage::CallError(CallError::from_fault(message_id, fault)),
        }
    }

    /// The frame's result as a dispatch response; `None` for a CALL
    pub fn into_response(self) -> Option<(String, Response<Value>)> {
        match self {
            OcppMessage::Call(_) => None,
            OcppMessage::CallResult(r) => Some((r.message_id, Response::Result(r.payload))),
            OcppMessage::CallError(e) => {
                let fault = e.to_fault();
                Some((e.message_id, Response::Error(fault)))
            }
        }
    }

    /// Parse an OCPP message from JSON bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, OcppError> {
        let mut array: Vec<Value> = serde_json::from_slice(bytes)?;

        let msg_type = array
            .first()
            .and_then(Value::as_i64)
            .ok_or(OcppError::InvalidFormat("message type must be an integer"))?;
        let msg_type = MessageType::from_code(msg_type)?;

        let base_len = match msg_type {
            MessageType::Call => 4,
            MessageType::CallResult => 3,
            MessageType::CallError => 5,
        };
        let network_path = match array.len() {
            n if n == base_len => None,
            n if n == base_len + 1 => array.pop().map(parse_path_extension).transpose()?,
            _ => return Err(OcppError::InvalidFormat("wrong number of elements")),
        };

        let message_id = array[1]
            .as_str()
            .ok_or(OcppError::InvalidFormat("message id must be a string"))?
            .to_string();

        match msg_type {
            MessageType::Call => {
                let action: Action = array[2]
                    .as_str()
                    .ok_or(OcppError::InvalidFormat("action must be a string"))?
                    .parse()?;

                Ok(OcppMessage::Call(Call {
                    message_id,
                    action,
                    payload: array[3].take(),
                    network_path,
                }))
            }
            MessageType::CallResult => Ok(OcppMessage::CallResult(CallResult {
                message_id,
                payload: array[2].take(),
                network_path,
            })),
            MessageType::CallError => {
                let error_code = array[2]
                    .as_str()
                    .ok_or(OcppError::InvalidFormat("error code must be a string"))?
                    .parse()
                    .unwrap_or(FaultCode::GenericError);

                let error_description = array[3].as_str().unwrap_or("").to_string();

                Ok(OcppMessage::CallError(CallError {
                    message_id,
                    error_code,
                    error_description,
                    error_details: array[4].take(),
                    network_path,
                }))
            }
        }
    }

    /// Best-effort message id of a frame that failed to parse
    pub fn recover_message_id(bytes: &[u8]) -> Option<String> {
        let array: Vec<Value> = serde_json::from_slice(bytes).ok()?;
        array.get(1)?.as_str().map(str::to_string)
    }

    /// Best-effort action of a CALL frame that failed to parse as a whole
    pub fn recover_action(bytes: &[u8]) -> Option<Action> {
        let array: Vec<Value> = serde_json::from_slice(bytes).ok()?;
        match MessageType::from_code(array.first()?.as_i64()?).ok()? {
            MessageType::Call => array.get(2)?.as_str()?.parse().ok(),
            _ => None,
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    pub fn network_path(&self) -> Option<&NetworkPath> {
        match self {
            OcppMessage::Call(c) => c.network_path.as_ref(),
            OcppMessage::CallResult(r) => r.network_path.as_ref(),
            OcppMessage::CallError(e) => e.network_path.as_ref(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            OcppMessage::Call(c) => c.to_value(),
            OcppMessage::CallResult(r) => r.to_value(),
            OcppMessage::CallError(e) => e.to_value(),
        }
    }

    /// Serialize to OCPP-J text
    pub fn to_text(&self) -> Result<String, OcppError> {
        Ok(serde_json::to_string(&self.to_value())?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        Ok(serde_json::to_vec(&self.to_value())?)
    }
}

fn with_path(mut elements: Vec<Value>, path: &Option<NetworkPath>) -> Value {
    if let Some(path) = path {
        let mut ext = serde_json::Map::new();
        ext.insert(
            NETWORK_PATH_KEY.to_string(),
            Value::Array(path.hops().iter().map(|h| Value::from(h.as_str())).collect()),
        );
        elements.push(Value::Object(ext));
    }
    Value::Array(elements)
}

fn parse_path_extension(ext: Value) -> Result<NetworkPath, OcppError> {
    let hops = match ext {
        Value::Object(mut map) => map
            .remove(NETWORK_PATH_KEY)
            .ok_or(OcppError::InvalidFormat("extension object without networkPath"))?,
        _ => return Err(OcppError::InvalidFormat("extension must be an object")),
    };
    Ok(serde_json::from_value(hops)?)
}
