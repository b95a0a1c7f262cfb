//! OCPP 2.0.1 protocol layer
//!
//! - `action`: the action catalog and which side initiates each action
//! - `messages`: OCPP-J text framing (CALL, CALLRESULT, CALLERROR)
//! - `binary`: binary framing for binary WebSocket frames
//! - `types`: schemas used by the reference handlers and policies

pub mod action;
pub mod binary;
pub mod messages;
pub mod types;

pub use action::{Action, Origin};
pub use binary::BinaryMessage;
pub use messages::*;
pub use types::*;
