//! Binary frame codec
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! u8  message type (2 CALL, 3 CALLRESULT, 4 CALLERROR)
//! u16 id length, id
//! CALL:      u16 action length, action
//! CALLERROR: u16 code length, code, u16 description length, description
//! u16 path hop count, then per hop: u16 length, hop
//! u32 payload length, payload
//! ```
//!
//! A hop count of zero means the frame carries no network path. For a
//! CALLERROR the payload holds the JSON error details.

use netnode_core::{Fault, FaultCode, NetworkPath, Response};

use super::action::Action;
use super::messages::{MessageType, OcppError};

/// Binary OCPP frame
#[derive(Debug, Clone, PartialEq)]
pub enum BinaryMessage {
    Call {
        message_id: String,
        action: Action,
        network_path: Option<NetworkPath>,
        payload: Vec<u8>,
    },
    CallResult {
        message_id: String,
        network_path: Option<NetworkPath>,
        payload: Vec<u8>,
    },
    CallError {
        message_id: String,
        code: FaultCode,
        description: String,
        network_path: Option<NetworkPath>,
        details: Vec<u8>,
    },
}

impl BinaryMessage {
    /// Frame answering `message_id` with a dispatch response
    pub fn from_response(message_id: impl Into<String>, response: &Response<Vec<u8>>) -> Self {
        match response {
            Response::Result(payload) => BinaryMessage::CallResult {
                message_id: message_id.into(),
                network_path: None,
                payload: payload.clone(),
            },
            Response::Error(fault) => BinaryMessage::CallError {
                message_id: message_id.into(),
                code: fault.code,
                description: fault.description.clone(),
                network_path: None,
                details: serde_json::to_vec(&fault.details).unwrap_or_else(|_| b"{}".to_vec()),
            },
        }
    }

    /// The frame's result as a dispatch response; `None` for a CALL
    pub fn into_response(self) -> Option<(String, Response<Vec<u8>>)> {
        match self {
            BinaryMessage::Call { .. } => None,
            BinaryMessage::CallResult { message_id, payload, .. } => Some((message_id, Response::Result(payload))),
            BinaryMessage::CallError {
                message_id,
                code,
                description,
                details,
                ..
            } => {
                let details = serde_json::from_slice(&details)
                    .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()));
                Some((message_id, Response::Error(Fault::new(code, description).with_details(details))))
            }
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            BinaryMessage::Call { message_id, .. }
            | BinaryMessage::CallResult { message_id, .. }
            | BinaryMessage::CallError { message_id, .. } => message_id,
        }
    }

    pub fn network_path(&self) -> Option<&NetworkPath> {
        match self {
            BinaryMessage::Call { network_path, .. }
            | BinaryMessage::CallResult { network_path, .. }
            | BinaryMessage::CallError { network_path, .. } => network_path.as_ref(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, OcppError> {
        let mut w = Writer::default();
        match self {
            BinaryMessage::Call {
                message_id,
                action,
                network_path,
                payload,
            } => {
                w.u8(MessageType::Call as u8);
                w.str16(message_id)?;
                w.str16(action.as_str())?;
                w.path(network_path)?;
                w.bytes32(payload)?;
            }
            BinaryMessage::CallResult {
                message_id,
                network_path,
                payload,
            } => {
                w.u8(MessageType::CallResult as u8);
                w.str16(message_id)?;
                w.path(network_path)?;
                w.bytes32(payload)?;
            }
            BinaryMessage::CallError {
                message_id,
                code,
                description,
                network_path,
                details,
            } => {
                w.u8(MessageType::CallError as u8);
                w.str16(message_id)?;
                w.str16(code.as_str())?;
                w.str16(description)?;
                w.path(network_path)?;
                w.bytes32(details)?;
            }
        }
        Ok(w.buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, OcppError> {
        let mut r = Reader::new(bytes);
        let msg_type = MessageType::from_code(i64::from(r.u8()?))?;
        let message_id = r.str16()?;

        let msg = match msg_type {
            MessageType::Call => {
                let action = r.str16()?.parse()?;
                let network_path = r.path()?;
                let payload = r.bytes32()?.to_vec();
                BinaryMessage::Call {
                    message_id,
                    action,
                    network_path,
                    payload,
                }
            }
            MessageType::CallResult => {
                let network_path = r.path()?;
                let payload = r.bytes32()?.to_vec();
                BinaryMessage::CallResult {
                    message_id,
                    network_path,
                    payload,
                }
            }
            MessageType::CallError => {
                let code = r.str16()?.parse().unwrap_or(FaultCode::GenericError);
                let description = r.str16()?;
                let network_path = r.path()?;
                let details = r.bytes32()?.to_vec();
                BinaryMessage::CallError {
                    message_id,
                    code,
                    description,
                    network_path,
                    details,
                }
            }
        };

        r.finish()?;
        Ok(msg)
    }

    /// Best-effort message id of a frame that failed to decode
    pub fn recover_message_id(bytes: &[u8]) -> Option<String> {
        let mut r = Reader::new(bytes);
        r.u8().ok()?;
        r.str16().ok()
    }

    /// Best-effort action of a CALL frame that failed to decode as a whole
    pub fn recover_action(bytes: &[u8]) -> Option<Action> {
        let mut r = Reader::new(bytes);
        if r.u8().ok()? != MessageType::Call as u8 {
            return None;
        }
        r.str16().ok()?;
        r.str16().ok()?.parse().ok()
    }
}

/// Big-endian length-prefixed writer
#[derive(Default)]
pub(crate) struct Writer {
    pub(crate) buf: Vec<u8>,
}

impl Writer {
    pub(crate) fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(crate) fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub(crate) fn str16(&mut self, s: &str) -> Result<(), OcppError> {
        let len = u16::try_from(s.len()).map_err(|_| OcppError::FieldTooLong(s.len()))?;
        self.u16(len);
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }

    pub(crate) fn bytes32(&mut self, b: &[u8]) -> Result<(), OcppError> {
        let len = u32::try_from(b.len()).map_err(|_| OcppError::FieldTooLong(b.len()))?;
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(b);
        Ok(())
    }

    fn path(&mut self, path: &Option<NetworkPath>) -> Result<(), OcppError> {
        let hops = path.as_ref().map(|p| p.hops()).unwrap_or(&[]);
        let count = u16::try_from(hops.len()).map_err(|_| OcppError::FieldTooLong(hops.len()))?;
        self.u16(count);
        for hop in hops {
            self.str16(hop)?;
        }
        Ok(())
    }
}

/// Cursor over a received frame
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], OcppError> {
        let end = self.pos.checked_add(n).ok_or(OcppError::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(OcppError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, OcppError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, OcppError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, OcppError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn str16(&mut self) -> Result<String, OcppError> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| OcppError::InvalidUtf8)
    }

    pub(crate) fn bytes32(&mut self) -> Result<&'a [u8], OcppError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    /// Everything not consumed yet
    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    fn path(&mut self) -> Result<Option<NetworkPath>, OcppError> {
        let count = self.u16()?;
        if count == 0 {
            return Ok(None);
        }
        let hops = (0..count).map(|_| self.str16()).collect::<Result<Vec<_>, _>>()?;
        Ok(Some(NetworkPath::new(hops)?))
    }

    pub(crate) fn finish(&self) -> Result<(), OcppError> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            extra => Err(OcppError::TrailingBytes(extra)),
        }
    }
}
