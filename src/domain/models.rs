use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Last known power state of the phone's Bluetooth radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RadioState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl RadioState {
    pub fn is_powered_on(self) -> bool {
        self == Self::PoweredOn
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Resetting => "resetting",
            Self::Unsupported => "unsupported",
            Self::Unauthorized => "unauthorized",
            Self::PoweredOff => "poweredOff",
            Self::PoweredOn => "poweredOn",
        };
        f.write_str(s)
    }
}

impl FromStr for RadioState {
    type Err = String;

    /// Accepts the adapter spellings (`poweredOn`, `powered_on`, `on`, ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "unknown" => Ok(Self::Unknown),
            "resetting" => Ok(Self::Resetting),
            "unsupported" => Ok(Self::Unsupported),
            "unauthorized" => Ok(Self::Unauthorized),
            "poweredoff" | "off" => Ok(Self::PoweredOff),
            "poweredon" | "on" => Ok(Self::PoweredOn),
            _ => Err(format!("unrecognized radio state: {}", s)),
        }
    }
}

/// Connection lifecycle phase. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    Reconnecting,
}

/// Snapshot of the connection state machine, as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub radio: RadioState,
    /// Device currently linked or being connected to.
    pub device_id: Option<String>,
    /// Set only once discovery and notification enablement succeeded.
    pub notifications_ready: bool,
    pub reconnect_attempts: u32,
    /// Last user-visible connection error.
    pub error: Option<String>,
}

impl ConnectionState {
    /// True when commands can be sent and their responses received.
    pub fn is_ready(&self) -> bool {
        self.phase == ConnectionPhase::Connected && self.notifications_ready
    }
}

/// A peripheral reported by scanning or by the bonded-device list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub service_uuids: Vec<Uuid>,
    #[serde(default)]
    pub bonded: bool,
}

impl DeviceDescriptor {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    ConnectionStatus(ConnectionPhase),
    DeviceFound(DeviceDescriptor),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radio_state_parsing() {
        assert_eq!("poweredOn".parse::<RadioState>(), Ok(RadioState::PoweredOn));
        assert_eq!("powered_off".parse::<RadioState>(), Ok(RadioState::PoweredOff));
        assert_eq!("Unauthorized".parse::<RadioState>(), Ok(RadioState::Unauthorized));
        assert!("sideways".parse::<RadioState>().is_err());
        assert_eq!(RadioState::PoweredOff.to_string(), "poweredOff");
    }

    #[test]
    fn test_ready_requires_notifications() {
        let mut state = ConnectionState {
            phase: ConnectionPhase::Connected,
            ..Default::default()
        };
        assert!(!state.is_ready());
        state.notifications_ready = true;
        assert!(state.is_ready());
    }
}
