//! OCPP 2.0.1 message types
//!
//! Schemas for the actions the node answers or inspects itself:
//! - Reset
//! - DataTransfer / BinaryDataTransfer
//! - BootNotification / Heartbeat
//! - StatusNotification

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::binary::{Reader, Writer};
use super::messages::OcppError;

// ============================================================================
// Enumerations
// ============================================================================

/// Connector status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorStatus {
    Available,
    Occupied,
    Reserved,
    Unavailable,
    Faulted,
}

/// Registration status for BootNotification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Accepted,
    Pending,
    Rejected,
}

/// Boot reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootReason {
    ApplicationReset,
    FirmwareUpdate,
    LocalReset,
    PowerUp,
    RemoteReset,
    ScheduledReset,
    Triggered,
    Unknown,
    Watchdog,
}

/// When a reset should happen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetType {
    Immediate,
    OnIdle,
}

/// Answer to a Reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetStatus {
    Accepted,
    Rejected,
    Scheduled,
}

/// Answer to a (Binary)DataTransfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataTransferStatus {
    Accepted,
    Rejected,
    UnknownMessageId,
    UnknownVendorId,
}

impl DataTransferStatus {
    fn code(self) -> u8 {
        match self {
            DataTransferStatus::Accepted => 0,
            DataTransferStatus::Rejected => 1,
            DataTransferStatus::UnknownMessageId => 2,
            DataTransferStatus::UnknownVendorId => 3,
        }
    }

    fn from_code(code: u8) -> Result<Self, OcppError> {
        match code {
            0 => Ok(DataTransferStatus::Accepted),
            1 => Ok(DataTransferStatus::Rejected),
            2 => Ok(DataTransferStatus::UnknownMessageId),
            3 => Ok(DataTransferStatus::UnknownVendorId),
            _ => Err(OcppError::InvalidFormat("unknown data transfer status")),
        }
    }
}

// ============================================================================
// Complex Types
// ============================================================================

/// Status info for responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusInfo {
    pub reason_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<String>,
}

impl StatusInfo {
    pub fn new(reason_code: impl Into<String>) -> Self {
        Self {
            reason_code: reason_code.into(),
            additional_info: None,
        }
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.additional_info = Some(info.into());
        self
    }
}

/// Charging station information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingStationInfo {
    pub model: String,
    pub vendor_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

// ============================================================================
// Requests and responses
// ============================================================================

/// Reset request (CSMS -> CS); no `evseId` means the whole station
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    #[serde(rename = "type")]
    pub reset_type: ResetType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evse_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetResponse {
    pub status: ResetStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
}

/// DataTransfer request (either direction)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferRequest {
    pub vendor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferResponse {
    pub status: DataTransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// BootNotification request (CS -> CSMS)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub charging_station: ChargingStationInfo,
    pub reason: BootReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub current_time: DateTime<Utc>,
    pub interval: i32,
    pub status: RegistrationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
}

/// Heartbeat request (CS -> CSMS)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: DateTime<Utc>,
}

/// StatusNotification request (CS -> CSMS)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotificationRequest {
    pub timestamp: DateTime<Utc>,
    pub connector_status: ConnectorStatus,
    pub evse_id: i32,
    pub connector_id: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusNotificationResponse {}

// ============================================================================
// Binary payloads
// ============================================================================

/// BinaryDataTransfer request body
///
/// `u16 vendor id length | vendor id | u16 message id length | message id |
/// data`; an empty message id means none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryDataTransferRequest {
    pub vendor_id: String,
    pub message_id: Option<String>,
    pub data: Vec<u8>,
}

impl BinaryDataTransferRequest {
    pub fn encode(&self) -> Result<Vec<u8>, OcppError> {
        let mut w = Writer::default();
        w.str16(&self.vendor_id)?;
        w.str16(self.message_id.as_deref().unwrap_or(""))?;
        w.buf.extend_from_slice(&self.data);
        Ok(w.buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, OcppError> {
        let mut r = Reader::new(bytes);
        let vendor_id = r.str16()?;
        let message_id = Some(r.str16()?).filter(|id| !id.is_empty());
        let data = r.rest().to_vec();
        Ok(Self {
            vendor_id,
            message_id,
            data,
        })
    }
}

/// BinaryDataTransfer response body: `u8 status | data`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryDataTransferResponse {
    pub status: DataTransferStatus,
    pub data: Vec<u8>,
}

impl BinaryDataTransferResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.u8(self.status.code());
        w.buf.extend_from_slice(&self.data);
        w.buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, OcppError> {
        let mut r = Reader::new(bytes);
        let status = DataTransferStatus::from_code(r.u8()?)?;
        Ok(Self {
            status,
            data: r.rest().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_request_wire_names() {
        let whole: ResetRequest = serde_json::from_str(r#"{"type": "Immediate"}"#).unwrap();
        assert_eq!(whole.reset_type, ResetType::Immediate);
        assert_eq!(whole.evse_id, None);

        let scoped: ResetRequest = serde_json::from_str(r#"{"type": "OnIdle", "evseId": 2}"#).unwrap();
        assert_eq!(scoped.evse_id, Some(2));
    }

    #[test]
    fn test_boot_notification_request() {
        let req = BootNotificationRequest {
            charging_station: ChargingStationInfo {
                model: "EK3".to_string(),
                vendor_name: "Elektrokombinacija".to_string(),
                serial_number: Some("EK3-001".to_string()),
                firmware_version: Some("0.1.0".to_string()),
            },
            reason: BootReason::PowerUp,
        };

        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["chargingStation"]["vendorName"], "Elektrokombinacija");
        assert_eq!(json["reason"], "PowerUp");
    }

    #[test]
    fn test_data_transfer_response_omits_empty_fields() {
        let res = DataTransferResponse {
            status: DataTransferStatus::Rejected,
            status_info: None,
            data: None,
        };
        assert_eq!(serde_json::to_string(&res).unwrap(), r#"{"status":"Rejected"}"#);
    }

    #[test]
    fn test_binary_data_transfer_bodies() {
        let req = BinaryDataTransferRequest {
            vendor_id: "com.example".to_string(),
            message_id: None,
            data: vec![1, 2, 3],
        };
        let bytes = req.encode().unwrap();
        assert_eq!(BinaryDataTransferRequest::decode(&bytes).unwrap(), req);

        let res = BinaryDataTransferResponse {
            status: DataTransferStatus::UnknownVendorId,
            data: Vec::new(),
        };
        assert_eq!(res.encode(), vec![3]);
        assert!(BinaryDataTransferResponse::decode(&[9]).is_err());
    }
}
