//! Error taxonomy for the ring protocol engine.

use crate::domain::models::RadioState;
use std::fmt;
use thiserror::Error;

/// A received or requested frame that does not fit the 16-byte wire format.
///
/// These never propagate out of the inbound path: the frame is logged and
/// dropped. They only surface to callers from [`Frame::encode`].
///
/// [`Frame::encode`]: super::protocol::Frame::encode
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("payload too large: {len} bytes (max 14)")]
    PayloadTooLarge { len: usize },

    #[error("invalid frame length: {len} bytes (expected 16)")]
    InvalidLength { len: usize },

    #[error("invalid checksum: expected {expected:#04x}, got {actual:#04x}")]
    InvalidChecksum { expected: u8, actual: u8 },
}

/// What a [`RingError::ProtocolTimeout`] was waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutKind {
    /// No complete response to a command arrived in time.
    Response { opcode: u8 },
    /// The adapter never confirmed a connection (or its setup) in time.
    Connect { device_id: String },
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Response { opcode } => write!(f, "no response to opcode {:#04x}", opcode),
            Self::Connect { device_id } => write!(f, "connection to {} not confirmed", device_id),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    /// A received frame failed validation.
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),

    /// An outgoing command payload does not fit in one frame.
    #[error("payload for opcode {opcode:#04x} too large: {len} bytes (max 14)")]
    PayloadTooLarge { opcode: u8, len: usize },

    #[error("protocol timeout: {0}")]
    ProtocolTimeout(TimeoutKind),

    #[error("not connected to a ring")]
    NotConnected,

    #[error("bluetooth is {0}")]
    RadioOff(RadioState),

    #[error("reconnect failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("a connection to {in_flight} is already in progress")]
    ConnectionBusy { in_flight: String },

    #[error("a request for opcode {opcode:#04x} is already pending")]
    RequestInFlight { opcode: u8 },

    #[error("no previous device to reconnect to")]
    NoSavedDevice,

    #[error("a scan is already running")]
    ScanInProgress,

    #[error("no matching ring found")]
    NoDeviceFound,

    #[error("service {0} not found")]
    ServiceNotFound(uuid::Uuid),

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(uuid::Uuid),

    #[error("invalid UUID: {0}")]
    InvalidUuid(String),

    #[error("adapter error: {0}")]
    Adapter(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("ring manager destroyed")]
    ManagerDestroyed,
}

impl RingError {
    /// Map a failure to encode a command for `opcode`.
    pub fn outbound(opcode: u8, err: FrameError) -> Self {
        match err {
            FrameError::PayloadTooLarge { len } => Self::PayloadTooLarge { opcode, len },
            other => Self::MalformedFrame(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_payload_error() {
        let err = RingError::outbound(0x03, FrameError::PayloadTooLarge { len: 15 });
        assert_eq!(err, RingError::PayloadTooLarge { opcode: 0x03, len: 15 });
        assert_eq!(
            err.to_string(),
            "payload for opcode 0x03 too large: 15 bytes (max 14)"
        );
    }

    #[test]
    fn test_error_display() {
        let err = RingError::ProtocolTimeout(TimeoutKind::Response { opcode: 0x15 });
        assert_eq!(err.to_string(), "protocol timeout: no response to opcode 0x15");

        let err = RingError::RadioOff(RadioState::PoweredOff);
        assert_eq!(err.to_string(), "bluetooth is poweredOff");

        let err: RingError = FrameError::InvalidLength { len: 3 }.into();
        assert_eq!(
            err.to_string(),
            "malformed frame: invalid frame length: 3 bytes (expected 16)"
        );
    }
}
