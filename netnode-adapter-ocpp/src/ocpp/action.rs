//! OCPP 2.0.1 action catalog
//!
//! Every action name the node understands, with the side that initiates it.
//! The binary-stream extensions (BinaryDataTransfer and the file actions)
//! travel over binary WebSocket frames.

use netnode_core::Direction;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::messages::OcppError;

/// Which side sends the request of an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    ChargingStation,
    Csms,
    Either,
}

impl Origin {
    /// Directions in which requests of this origin arrive
    pub fn directions(self) -> &'static [Direction] {
        match self {
            Origin::ChargingStation => &[Direction::DeviceToSystem],
            Origin::Csms => &[Direction::SystemToDevice],
            Origin::Either => &[Direction::DeviceToSystem, Direction::SystemToDevice],
        }
    }
}

macro_rules! actions {
    ($($name:ident => $origin:ident),+ $(,)?) => {
        /// OCPP action name
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum Action {
            $($name,)+
        }

        impl Action {
            pub const ALL: &'static [Action] = &[$(Action::$name,)+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Action::$name => stringify!($name),)+
                }
            }

            pub fn origin(&self) -> Origin {
                match self {
                    $(Action::$name => Origin::$origin,)+
                }
            }
        }

        impl FromStr for Action {
            type Err = OcppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $(stringify!($name) => Ok(Action::$name),)+
                    _ => Err(OcppError::UnknownAction(s.to_string())),
                }
            }
        }
    };
}

actions! {
    // Charging station -> CSMS
    Authorize => ChargingStation,
    BootNotification => ChargingStation,
    ClearedChargingLimit => ChargingStation,
    FirmwareStatusNotification => ChargingStation,
    Get15118EVCertificate => ChargingStation,
    GetCertificateStatus => ChargingStation,
    Heartbeat => ChargingStation,
    LogStatusNotification => ChargingStation,
    MeterValues => ChargingStation,
    NotifyChargingLimit => ChargingStation,
    NotifyCustomerInformation => ChargingStation,
    NotifyDisplayMessages => ChargingStation,
    NotifyEVChargingNeeds => ChargingStation,
    NotifyEVChargingSchedule => ChargingStation,
    NotifyEvent => ChargingStation,
    NotifyMonitoringReport => ChargingStation,
    NotifyReport => ChargingStation,
    PublishFirmwareStatusNotification => ChargingStation,
    ReportChargingProfiles => ChargingStation,
    ReservationStatusUpdate => ChargingStation,
    SecurityEventNotification => ChargingStation,
    SignCertificate => ChargingStation,
    StatusNotification => ChargingStation,
    TransactionEvent => ChargingStation,

    // CSMS -> charging station
    CancelReservation => Csms,
    CertificateSigned => Csms,
    ChangeAvailability => Csms,
    ClearCache => Csms,
    ClearChargingProfile => Csms,
    ClearDisplayMessage => Csms,
    ClearVariableMonitoring => Csms,
    CostUpdated => Csms,
    CustomerInformation => Csms,
    DeleteCertificate => Csms,
    GetBaseReport => Csms,
    GetChargingProfiles => Csms,
    GetCompositeSchedule => Csms,
    GetDisplayMessages => Csms,
    GetInstalledCertificateIds => Csms,
    GetLocalListVersion => Csms,
    GetLog => Csms,
    GetMonitoringReport => Csms,
    GetReport => Csms,
    GetTransactionStatus => Csms,
    GetVariables => Csms,
    InstallCertificate => Csms,
    PublishFirmware => Csms,
    RequestStartTransaction => Csms,
    RequestStopTransaction => Csms,
    ReserveNow => Csms,
    Reset => Csms,
    SendLocalList => Csms,
    SetChargingProfile => Csms,
    SetDisplayMessage => Csms,
    SetMonitoringBase => Csms,
    SetMonitoringLevel => Csms,
    SetNetworkProfile => Csms,
    SetVariableMonitoring => Csms,
    SetVariables => Csms,
    TriggerMessage => Csms,
    UnlockConnector => Csms,
    UnpublishFirmware => Csms,
    UpdateFirmware => Csms,

    // Both directions
    DataTransfer => Either,

    // Binary stream extensions
    BinaryDataTransfer => Either,
    GetFile => Csms,
    SendFile => Csms,
    DeleteFile => Csms,
    ListDirectory => Csms,
}

impl Action {
    /// True when requests of this action may arrive in `direction`
    pub fn accepts(&self, direction: Direction) -> bool {
        self.origin().directions().contains(&direction)
    }

    /// Actions whose requests arrive in `direction`
    pub fn arriving(direction: Direction) -> impl Iterator<Item = Action> {
        Self::ALL.iter().copied().filter(move |a| a.accepts(direction))
    }

    /// Actions carried over binary frames
    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            Action::BinaryDataTransfer
                | Action::GetFile
                | Action::SendFile
                | Action::DeleteFile
                | Action::ListDirectory
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for action in Action::ALL {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), *action);
        }
        assert!(matches!(
            "Teleport".parse::<Action>(),
            Err(OcppError::UnknownAction(name)) if name == "Teleport"
        ));
    }

    #[test]
    fn test_catalog_size() {
        let core = Action::ALL.iter().filter(|a| !a.is_binary()).count();
        assert_eq!(core, 64);
    }

    #[test]
    fn test_origin_selects_direction() {
        assert!(Action::Heartbeat.accepts(Direction::DeviceToSystem));
        assert!(!Action::Heartbeat.accepts(Direction::SystemToDevice));
        assert!(Action::Reset.accepts(Direction::SystemToDevice));
        assert!(Action::DataTransfer.accepts(Direction::DeviceToSystem));
        assert!(Action::DataTransfer.accepts(Direction::SystemToDevice));

        let upward: Vec<Action> = Action::arriving(Direction::DeviceToSystem).collect();
        assert!(upward.contains(&Action::BootNotification));
        assert!(!upward.contains(&Action::GetBaseReport));
    }
}
