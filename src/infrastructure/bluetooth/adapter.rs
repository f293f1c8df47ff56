//! BLE adapter capability.
//!
//! The radio stack itself lives outside this crate. An adapter exposes the
//! scan/connect/GATT primitives plus an event stream, and everything it
//! reports is validated here before it reaches the manager.

use crate::domain::models::{DeviceDescriptor, RadioState};
use crate::infrastructure::bluetooth::error::RingError;
use crate::infrastructure::bluetooth::protocol::parse_uuid;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// A peripheral as the adapter reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawPeripheral {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i32>,
    pub service_uuids: Vec<String>,
}

/// A discovered GATT service and its characteristic UUIDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawService {
    pub uuid: String,
    pub characteristics: Vec<String>,
}

/// Untyped adapter events, straight from the native layer.
#[derive(Debug, Clone)]
pub enum RawAdapterEvent {
    StateChanged { state: String },
    DiscoveredPeripheral(RawPeripheral),
    Connected { peripheral: String },
    Disconnected { peripheral: Option<String> },
    CharacteristicUpdated {
        peripheral: String,
        characteristic: String,
        value: Vec<u8>,
    },
}

#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Bring the native stack up. Called once by `initialize`.
    async fn start(&self) -> Result<(), RingError>;

    async fn radio_state(&self) -> Result<String, RingError>;

    async fn bonded_peripherals(&self) -> Result<Vec<RawPeripheral>, RingError>;

    /// Start discovery. Results arrive as `DiscoveredPeripheral` events.
    async fn start_scan(&self, service_uuids: &[Uuid], duration: Duration) -> Result<(), RingError>;

    async fn stop_scan(&self) -> Result<(), RingError>;

    /// Issue a connect. Completion is reported by a `Connected` event, which
    /// may never come.
    async fn connect(&self, device_id: &str) -> Result<(), RingError>;

    async fn disconnect(&self, device_id: &str) -> Result<(), RingError>;

    async fn discover_services(&self, device_id: &str) -> Result<Vec<RawService>, RingError>;

    async fn write(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), RingError>;

    async fn enable_notifications(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), RingError>;

    fn subscribe(&self) -> broadcast::Receiver<RawAdapterEvent>;
}

/// Adapter events after boundary validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    RadioChanged(RadioState),
    Discovered(DeviceDescriptor),
    Connected { device_id: String },
    /// The native layer does not always say which peripheral dropped.
    Disconnected { device_id: Option<String> },
    Notification {
        device_id: String,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

impl AdapterEvent {
    /// Validate a raw event. Anything that does not fit is logged and
    /// dropped.
    pub fn from_raw(raw: RawAdapterEvent) -> Option<Self> {
        match raw {
            RawAdapterEvent::StateChanged { state } => match state.parse::<RadioState>() {
                Ok(radio) => Some(Self::RadioChanged(radio)),
                Err(e) => {
                    warn!("Ignoring radio state event: {}", e);
                    None
                }
            },
            RawAdapterEvent::DiscoveredPeripheral(peripheral) => {
                match validate_peripheral(peripheral, false) {
                    Ok(device) => Some(Self::Discovered(device)),
                    Err(e) => {
                        debug!("Ignoring discovered peripheral: {}", e);
                        None
                    }
                }
            }
            RawAdapterEvent::Connected { peripheral } => {
                non_empty(peripheral).map(|device_id| Self::Connected { device_id })
            }
            RawAdapterEvent::Disconnected { peripheral } => Some(Self::Disconnected {
                device_id: peripheral.and_then(non_empty),
            }),
            RawAdapterEvent::CharacteristicUpdated {
                peripheral,
                characteristic,
                value,
            } => {
                let device_id = non_empty(peripheral)?;
                match parse_uuid(&characteristic) {
                    Ok(characteristic) => Some(Self::Notification {
                        device_id,
                        characteristic,
                        value,
                    }),
                    Err(e) => {
                        warn!("Ignoring notification: {}", e);
                        None
                    }
                }
            }
        }
    }
}

/// Coerce a raw peripheral into a [`DeviceDescriptor`].
///
/// Peripherals without an id are rejected. Unparseable service UUIDs are
/// dropped and RSSI is clamped into `i16`.
pub fn validate_peripheral(
    raw: RawPeripheral,
    bonded: bool,
) -> Result<DeviceDescriptor, RingError> {
    let id = non_empty(raw.id)
        .ok_or_else(|| RingError::Adapter("peripheral reported without an id".to_string()))?;

    let service_uuids = raw
        .service_uuids
        .iter()
        .filter_map(|uuid| match parse_uuid(uuid) {
            Ok(uuid) => Some(uuid),
            Err(_) => {
                debug!("Dropping unparseable service UUID {:?} from {}", uuid, id);
                None
            }
        })
        .collect();

    Ok(DeviceDescriptor {
        id,
        name: raw.name.and_then(non_empty),
        rssi: raw
            .rssi
            .map(|rssi| rssi.clamp(i16::MIN as i32, i16::MAX as i32) as i16),
        service_uuids,
        bonded,
    })
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed.len() == value.len() {
        Some(value)
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::{NOTIFY_CHAR_UUID, SERVICE_UUID};

    #[test]
    fn test_peripheral_validation() {
        let device = validate_peripheral(
            RawPeripheral {
                id: "C0:FF:EE:00:11:22".to_string(),
                name: Some("  ".to_string()),
                rssi: Some(-70_000),
                service_uuids: vec![SERVICE_UUID.to_string(), "garbage".to_string()],
            },
            true,
        )
        .unwrap();

        assert_eq!(device.name, None);
        assert_eq!(device.display_name(), "Unknown");
        assert_eq!(device.rssi, Some(i16::MIN));
        assert_eq!(device.service_uuids, vec![SERVICE_UUID]);
        assert!(device.bonded);
    }

    #[test]
    fn test_peripheral_without_id_rejected() {
        let raw = RawPeripheral {
            id: String::new(),
            name: Some("R02_AB".to_string()),
            ..Default::default()
        };
        assert!(validate_peripheral(raw, false).is_err());
        assert_eq!(
            AdapterEvent::from_raw(RawAdapterEvent::DiscoveredPeripheral(RawPeripheral::default())),
            None
        );
    }

    #[test]
    fn test_event_validation() {
        assert_eq!(
            AdapterEvent::from_raw(RawAdapterEvent::StateChanged {
                state: "poweredOff".to_string()
            }),
            Some(AdapterEvent::RadioChanged(RadioState::PoweredOff))
        );
        assert_eq!(
            AdapterEvent::from_raw(RawAdapterEvent::StateChanged {
                state: "???".to_string()
            }),
            None
        );
        assert_eq!(
            AdapterEvent::from_raw(RawAdapterEvent::Connected {
                peripheral: String::new()
            }),
            None
        );
        assert_eq!(
            AdapterEvent::from_raw(RawAdapterEvent::Disconnected {
                peripheral: Some(String::new())
            }),
            Some(AdapterEvent::Disconnected { device_id: None })
        );
        assert_eq!(
            AdapterEvent::from_raw(RawAdapterEvent::CharacteristicUpdated {
                peripheral: "ring".to_string(),
                characteristic: "fd04".to_string(),
                value: vec![1, 2, 3],
            }),
            Some(AdapterEvent::Notification {
                device_id: "ring".to_string(),
                characteristic: NOTIFY_CHAR_UUID,
                value: vec![1, 2, 3],
            })
        );
    }
}
