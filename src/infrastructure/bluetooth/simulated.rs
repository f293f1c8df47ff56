//! In-process simulated ring
//!
//! Implements [`BleAdapter`] without hardware: one peripheral that answers
//! commands through a responder closure. Used by the integration tests and
//! the demo binary. Failure modes (silent or failing connects, dropped
//! links, radio changes) can be injected at any time.

use crate::domain::opcode::Opcode;
use crate::infrastructure::bluetooth::adapter::{
    BleAdapter, RawAdapterEvent, RawPeripheral, RawService,
};
use crate::infrastructure::bluetooth::error::RingError;
use crate::infrastructure::bluetooth::protocol::{
    Frame, NOTIFY_CHAR_UUID, SERVICE_UUID, WRITE_CHAR_UUID,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

/// Builds the frames the ring notifies in answer to one written frame.
pub type Responder = Box<dyn Fn(&Frame) -> Vec<Frame> + Send + Sync>;

/// How the simulated ring reacts to a connect call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Confirm the link with a `Connected` event.
    Confirm,
    /// Accept the call but never confirm.
    Silent,
    /// Fail the call.
    Fail(String),
}

struct SimState {
    radio: String,
    peripheral: RawPeripheral,
    bonded: bool,
    connect_behavior: ConnectBehavior,
    connected: bool,
    notifying: bool,
    scanning: bool,
    services: Vec<RawService>,
    writes: Vec<Vec<u8>>,
    responder: Option<Responder>,
}

pub struct SimulatedRing {
    state: Mutex<SimState>,
    events: broadcast::Sender<RawAdapterEvent>,
    connect_calls: AtomicUsize,
}

impl Default for SimulatedRing {
    fn default() -> Self {
        Self::new("C0:FF:EE:12:34:56", "R02_3456")
    }
}

impl SimulatedRing {
    pub fn new(device_id: &str, name: &str) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(SimState {
                radio: "poweredOn".to_string(),
                peripheral: RawPeripheral {
                    id: device_id.to_string(),
                    name: Some(name.to_string()),
                    rssi: Some(-58),
                    service_uuids: vec![SERVICE_UUID.to_string()],
                },
                bonded: false,
                connect_behavior: ConnectBehavior::Confirm,
                connected: false,
                notifying: false,
                scanning: false,
                services: vec![
                    RawService {
                        uuid: "1800".to_string(),
                        characteristics: vec!["2a00".to_string()],
                    },
                    RawService {
                        uuid: SERVICE_UUID.to_string(),
                        characteristics: vec![
                            short_form(WRITE_CHAR_UUID),
                            short_form(NOTIFY_CHAR_UUID),
                        ],
                    },
                ],
                writes: Vec::new(),
                responder: Some(Box::new(default_responder)),
            }),
            events,
            connect_calls: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: RawAdapterEvent) {
        trace!("sim event {:?}", event);
        let _ = self.events.send(event);
    }

    pub fn device_id(&self) -> String {
        self.state().peripheral.id.clone()
    }

    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        self.state().connect_behavior = behavior;
    }

    pub fn set_bonded(&self, bonded: bool) {
        self.state().bonded = bonded;
    }

    pub fn set_services(&self, services: Vec<RawService>) {
        self.state().services = services;
    }

    pub fn set_responder(&self, responder: Option<Responder>) {
        self.state().responder = responder;
    }

    /// Native connect invocations so far.
    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Every frame written to the write characteristic, oldest first.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state().writes.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    /// Drop the link from the ring's side.
    pub fn drop_link(&self) {
        let id = {
            let mut state = self.state();
            state.connected = false;
            state.notifying = false;
            state.peripheral.id.clone()
        };
        self.emit(RawAdapterEvent::Disconnected {
            peripheral: Some(id),
        });
    }

    /// Change the radio state and report it.
    pub fn set_radio(&self, radio: &str) {
        let lost = {
            let mut state = self.state();
            state.radio = radio.to_string();
            let lost = radio != "poweredOn" && state.connected;
            if lost {
                state.connected = false;
                state.notifying = false;
            }
            lost.then(|| state.peripheral.id.clone())
        };
        self.emit(RawAdapterEvent::StateChanged {
            state: radio.to_string(),
        });
        if let Some(id) = lost {
            self.emit(RawAdapterEvent::Disconnected {
                peripheral: Some(id),
            });
        }
    }

    /// Push raw bytes on the notify characteristic.
    pub fn notify_raw(&self, value: Vec<u8>) {
        let id = self.device_id();
        self.emit(RawAdapterEvent::CharacteristicUpdated {
            peripheral: id,
            characteristic: short_form(NOTIFY_CHAR_UUID),
            value,
        });
    }

    pub fn notify(&self, frame: Frame) {
        self.notify_raw(frame.as_bytes().to_vec());
    }

    fn ensure_connected(&self, device_id: &str) -> Result<(), RingError> {
        let state = self.state();
        if state.connected && state.peripheral.id == device_id {
            Ok(())
        } else {
            Err(RingError::Adapter(format!("{} is not connected", device_id)))
        }
    }
}

#[async_trait]
impl BleAdapter for SimulatedRing {
    async fn start(&self) -> Result<(), RingError> {
        debug!("Simulated adapter started");
        Ok(())
    }

    async fn radio_state(&self) -> Result<String, RingError> {
        Ok(self.state().radio.clone())
    }

    async fn bonded_peripherals(&self) -> Result<Vec<RawPeripheral>, RingError> {
        let state = self.state();
        Ok(if state.bonded {
            vec![state.peripheral.clone()]
        } else {
            Vec::new()
        })
    }

    async fn start_scan(
        &self,
        _service_uuids: &[Uuid],
        _duration: Duration,
    ) -> Result<(), RingError> {
        let peripheral = {
            let mut state = self.state();
            if state.radio != "poweredOn" {
                return Err(RingError::Adapter("radio unavailable".to_string()));
            }
            state.scanning = true;
            state.peripheral.clone()
        };

        // a neighbour that no ring filter should match, and a repeated advert
        self.emit(RawAdapterEvent::DiscoveredPeripheral(RawPeripheral {
            id: "AA:BB:CC:00:00:01".to_string(),
            name: Some("Headphones".to_string()),
            rssi: Some(-80),
            service_uuids: Vec::new(),
        }));
        self.emit(RawAdapterEvent::DiscoveredPeripheral(peripheral.clone()));
        self.emit(RawAdapterEvent::DiscoveredPeripheral(peripheral));
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), RingError> {
        self.state().scanning = false;
        Ok(())
    }

    async fn connect(&self, device_id: &str) -> Result<(), RingError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = {
            let state = self.state();
            if state.peripheral.id != device_id {
                return Err(RingError::Adapter(format!("unknown peripheral {}", device_id)));
            }
            state.connect_behavior.clone()
        };

        match behavior {
            ConnectBehavior::Confirm => {
                self.state().connected = true;
                self.emit(RawAdapterEvent::Connected {
                    peripheral: device_id.to_string(),
                });
                Ok(())
            }
            ConnectBehavior::Silent => Ok(()),
            ConnectBehavior::Fail(reason) => Err(RingError::Adapter(reason)),
        }
    }

    async fn disconnect(&self, device_id: &str) -> Result<(), RingError> {
        let was_connected = {
            let mut state = self.state();
            let was_connected = state.connected && state.peripheral.id == device_id;
            if was_connected {
                state.connected = false;
                state.notifying = false;
            }
            was_connected
        };
        if was_connected {
            self.emit(RawAdapterEvent::Disconnected {
                peripheral: Some(device_id.to_string()),
            });
        }
        Ok(())
    }

    async fn discover_services(&self, device_id: &str) -> Result<Vec<RawService>, RingError> {
        self.ensure_connected(device_id)?;
        Ok(self.state().services.clone())
    }

    async fn write(
        &self,
        device_id: &str,
        _service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), RingError> {
        self.ensure_connected(device_id)?;
        if characteristic != WRITE_CHAR_UUID {
            return Err(RingError::Adapter(format!("{} is not writable", characteristic)));
        }

        let replies = {
            let mut state = self.state();
            state.writes.push(data.to_vec());
            match (&state.responder, Frame::decode(data)) {
                (Some(responder), Ok(frame)) if state.notifying => responder(&frame),
                _ => Vec::new(),
            }
        };
        for frame in replies {
            self.notify(frame);
        }
        Ok(())
    }

    async fn enable_notifications(
        &self,
        device_id: &str,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), RingError> {
        self.ensure_connected(device_id)?;
        if characteristic != NOTIFY_CHAR_UUID {
            return Err(RingError::Adapter(format!("{} does not notify", characteristic)));
        }
        self.state().notifying = true;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RawAdapterEvent> {
        self.events.subscribe()
    }
}

/// 16-bit short form the way native stacks report standard-base UUIDs.
fn short_form(uuid: Uuid) -> String {
    format!("{:04x}", (uuid.as_u128() >> 96) as u16)
}

fn reply(opcode: Opcode, payload: &[u8]) -> Vec<Frame> {
    Frame::encode(opcode.code(), payload).into_iter().collect()
}

/// Canned answers for the commands the ring data service sends.
pub fn default_responder(request: &Frame) -> Vec<Frame> {
    let Some(opcode) = Opcode::from_code(request.opcode()) else {
        return Vec::new();
    };

    let packets: Vec<(Opcode, Vec<u8>)> = match opcode {
        Opcode::GetBattery => vec![(opcode, vec![85, 0])],
        Opcode::GetDeviceInfo => vec![(opcode, vec![0x02, 0x03, 0x01, 0x05])],
        Opcode::ReadTotalSportData => {
            vec![(opcode, vec![0x00, 0x10, 0x27, 0x00, 0x00, 0xE8, 0x03])]
        }
        Opcode::ReadHeartRate => vec![
            (opcode, vec![0x00, 0x03]),
            (opcode, vec![0x01, 0x40, 0x6B, 0x5E, 0x66]),
            (opcode, vec![0x02, 62, 64, 66, 71, 70, 68, 65, 63, 61, 60, 0, 0, 0]),
        ],
        Opcode::Hrv => vec![(opcode, vec![0x00, 0x00])],
        Opcode::ReadPressure => vec![
            // two 6-byte records per frame, the last one is the end-of-records timestamp
            (opcode, vec![0x02, 0x40, 0x6B, 0x5E, 0x66, 118, 0x80, 0x79, 0x5E, 0x66, 121, 0x00]),
            (opcode, vec![0x03, 0xC0, 0x87, 0x5E, 0x66, 117, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00]),
        ],
        Opcode::ReadSleepDetails => vec![
            (opcode, vec![0xF0, 0x00, 0x00, 0x00, 0x00, 0x02]),
            (opcode, vec![0x01, 0x24, 0x05, 0x18]),
            (opcode, vec![0x02, 0x17, 0x1E, 0x02, 0x2D]),
        ],
        Opcode::StartHeartRate => vec![
            (opcode, vec![0x01]),
            (Opcode::RealTimeHeartRate, vec![72]),
            (Opcode::RealTimeHeartRate, vec![74]),
            (Opcode::RealTimeHeartRate, vec![73]),
        ],
        Opcode::StopHeartRate => vec![(opcode, vec![0x00])],
        _ => Vec::new(),
    };

    packets
        .into_iter()
        .flat_map(|(opcode, payload)| reply(opcode, &payload))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::reassembly::Reassembler;

    #[test]
    fn test_short_form() {
        assert_eq!(short_form(WRITE_CHAR_UUID), "fd03");
        assert_eq!(short_form(NOTIFY_CHAR_UUID), "fd04");
    }

    #[test]
    fn test_default_responses_reassemble() {
        for opcode in [
            Opcode::GetBattery,
            Opcode::ReadHeartRate,
            Opcode::Hrv,
            Opcode::ReadPressure,
            Opcode::ReadSleepDetails,
        ] {
            let request = Frame::encode(opcode.code(), &[]).unwrap();
            let mut reassembler = Reassembler::default();
            let mut complete = false;
            for frame in default_responder(&request) {
                complete = !reassembler.process_packet(frame.opcode(), &frame);
            }
            assert!(complete, "{:?} never completed", opcode);
        }
    }

    #[test]
    fn test_pressure_reply_ends_on_sentinel_record() {
        let request = Frame::encode(Opcode::ReadPressure.code(), &[]).unwrap();
        let frames = default_responder(&request);
        assert_eq!(frames.len(), 2);

        let mut reassembler = Reassembler::default();
        assert!(reassembler.process_packet(frames[0].opcode(), &frames[0]));
        assert!(!reassembler.process_packet(frames[1].opcode(), &frames[1]));
        let packets = reassembler.take_complete(Opcode::ReadPressure.code()).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(&packets[1][6..10], &[0xFF; 4]);
    }

    #[tokio::test]
    async fn test_connect_behaviors() {
        let ring = SimulatedRing::default();
        let id = ring.device_id();
        let mut events = ring.subscribe();

        ring.set_connect_behavior(ConnectBehavior::Silent);
        ring.connect(&id).await.unwrap();
        assert!(!ring.is_connected());

        ring.set_connect_behavior(ConnectBehavior::Fail("gatt 133".to_string()));
        assert!(ring.connect(&id).await.is_err());

        ring.set_connect_behavior(ConnectBehavior::Confirm);
        ring.connect(&id).await.unwrap();
        assert!(ring.is_connected());
        assert!(matches!(events.recv().await.unwrap(), RawAdapterEvent::Connected { .. }));
        assert_eq!(ring.connect_calls(), 3);
    }
}
