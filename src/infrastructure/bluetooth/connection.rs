//! BLE Connection Module
//!
//! Connection configuration, GATT handle resolution and the connection
//! state machine.
//!
//! The machine does no I/O. The manager feeds it [`Input`]s (caller
//! requests, adapter events, timer expiries, results of adapter calls) and
//! carries out the [`Effect`]s it returns. Every input carries enough
//! identity (device id, generation, epoch) for stale events to be ignored.

use crate::domain::models::{ConnectionPhase, ConnectionState, RadioState};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::adapter::RawService;
use crate::infrastructure::bluetooth::error::{RingError, TimeoutKind};
use crate::infrastructure::bluetooth::protocol::{self, parse_uuid};
use crate::infrastructure::bluetooth::scanner::ScanFilter;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Service UUID to look for
    pub service_uuid: Uuid,
    /// Characteristic commands are written to
    pub write_char_uuid: Uuid,
    /// Characteristic responses are notified on
    pub notify_char_uuid: Uuid,
    /// Watchdog for connect confirmation plus setup
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Delay between automatic reconnect attempts
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Settle time between connect confirmation and service discovery
    pub discovery_delay: Duration,
    pub scan_duration: Duration,
    pub scan_filter: ScanFilter,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default()).unwrap_or_else(|_| Self {
            service_uuid: protocol::SERVICE_UUID,
            write_char_uuid: protocol::WRITE_CHAR_UUID,
            notify_char_uuid: protocol::NOTIFY_CHAR_UUID,
            connect_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(2),
            max_reconnect_attempts: 2,
            discovery_delay: Duration::from_millis(500),
            scan_duration: Duration::from_secs(10),
            scan_filter: ScanFilter::default(),
        })
    }
}

impl ConnectionConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, RingError> {
        Ok(Self {
            service_uuid: parse_uuid(&settings.ble_service_uuid)?,
            write_char_uuid: parse_uuid(&settings.ble_write_char_uuid)?,
            notify_char_uuid: parse_uuid(&settings.ble_notify_char_uuid)?,
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            request_timeout: Duration::from_millis(settings.request_timeout_ms),
            reconnect_delay: Duration::from_millis(settings.reconnect_delay_ms),
            max_reconnect_attempts: settings.max_reconnect_attempts,
            discovery_delay: Duration::from_millis(settings.discovery_delay_ms),
            scan_duration: Duration::from_millis(settings.scan_duration_ms),
            scan_filter: ScanFilter::from_settings(settings),
        })
    }
}

/// Resolved GATT endpoints of one connection generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattHandles {
    pub device_id: String,
    pub service: Uuid,
    pub write: Uuid,
    pub notify: Uuid,
}

impl GattHandles {
    /// Find the ring service and its two characteristics among the
    /// discovered services.
    pub fn resolve(
        device_id: &str,
        services: &[RawService],
        config: &ConnectionConfig,
    ) -> Result<Self, RingError> {
        let service = services
            .iter()
            .find(|s| parse_uuid(&s.uuid).ok() == Some(config.service_uuid))
            .ok_or(RingError::ServiceNotFound(config.service_uuid))?;

        let characteristics: Vec<Uuid> = service
            .characteristics
            .iter()
            .filter_map(|c| parse_uuid(c).ok())
            .collect();

        for uuid in [config.write_char_uuid, config.notify_char_uuid] {
            if !characteristics.contains(&uuid) {
                return Err(RingError::CharacteristicNotFound(uuid));
            }
        }

        Ok(Self {
            device_id: device_id.to_string(),
            service: config.service_uuid,
            write: config.write_char_uuid,
            notify: config.notify_char_uuid,
        })
    }
}

/// Who asked for a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOrigin {
    /// `connect(id)` from the application.
    User,
    /// `reconnect()` from the application.
    Manual,
    /// Scheduled after an unexpected disconnect.
    Auto,
}

#[derive(Debug)]
pub enum Input {
    RadioChanged(RadioState),
    Connect {
        device_id: String,
        origin: ConnectOrigin,
    },
    /// The native connect call returned.
    ConnectIssued {
        generation: u64,
        result: Result<(), RingError>,
    },
    /// The adapter confirmed a link.
    Connected { device_id: String },
    /// Discovery and notification enablement finished.
    SetupFinished {
        generation: u64,
        result: Result<GattHandles, RingError>,
    },
    Disconnected { device_id: Option<String> },
    WatchdogExpired { generation: u64 },
    ReconnectDue { epoch: u64 },
    /// User-initiated disconnect. Never followed by a reconnect.
    Disconnect,
    ScanStarted,
    ScanStopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Fail the caller of the current `Connect` input.
    Reject(RingError),
    /// The caller waits on the attempt already in flight.
    Join,
    /// The caller's device is already connected and ready.
    Ready,
    IssueConnect { device_id: String, generation: u64 },
    ArmWatchdog { generation: u64 },
    CancelWatchdog,
    /// Settle delay, discovery and notification enablement.
    StartSetup { device_id: String, generation: u64 },
    IssueDisconnect { device_id: String },
    ScheduleReconnect { epoch: u64, delay: Duration },
    CancelReconnect,
    /// Complete every waiter of the current attempt.
    Settle(Result<(), RingError>),
    /// The ready link is gone and its handles are invalid.
    LinkLost { device_id: String },
    RememberDevice(String),
}

#[derive(Debug, Clone)]
struct Attempt {
    device_id: String,
    generation: u64,
    origin: ConnectOrigin,
    /// The adapter confirmed the link and setup is running.
    confirmed: bool,
}

#[derive(Debug, Clone)]
struct Link {
    generation: u64,
    handles: GattHandles,
}

#[derive(Debug, Clone)]
struct PendingReconnect {
    device_id: String,
    epoch: u64,
}

/// Connection lifecycle as one state value.
///
/// The phase is derived from which of attempt / link / pending reconnect
/// is present, so exactly one phase holds at a time.
#[derive(Debug)]
pub struct ConnectionMachine {
    radio: RadioState,
    /// The connection lock. Held while an attempt is in flight.
    attempt: Option<Attempt>,
    link: Option<Link>,
    reconnect: Option<PendingReconnect>,
    scanning: bool,
    generation: u64,
    epoch: u64,
    reconnect_attempts: u32,
    max_reconnect_attempts: u32,
    reconnect_delay: Duration,
    last_device: Option<String>,
    last_error: Option<RingError>,
}

impl ConnectionMachine {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            radio: RadioState::Unknown,
            attempt: None,
            link: None,
            reconnect: None,
            scanning: false,
            generation: 0,
            epoch: 0,
            reconnect_attempts: 0,
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_delay: config.reconnect_delay,
            last_device: None,
            last_error: None,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        if self.attempt.is_some() {
            ConnectionPhase::Connecting
        } else if self.link.is_some() {
            ConnectionPhase::Connected
        } else if self.reconnect.is_some() {
            ConnectionPhase::Reconnecting
        } else if self.scanning {
            ConnectionPhase::Scanning
        } else {
            ConnectionPhase::Disconnected
        }
    }

    pub fn radio(&self) -> RadioState {
        self.radio
    }

    pub fn handles(&self) -> Option<&GattHandles> {
        self.link.as_ref().map(|link| &link.handles)
    }

    pub fn is_ready(&self) -> bool {
        self.link.is_some()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn last_device(&self) -> Option<&str> {
        self.last_device.as_deref()
    }

    pub fn remember_last_device(&mut self, device_id: String) {
        self.last_device = Some(device_id);
    }

    pub fn forget_last_device(&mut self) {
        self.last_device = None;
    }

    pub fn last_error(&self) -> Option<&RingError> {
        self.last_error.as_ref()
    }

    pub fn snapshot(&self) -> ConnectionState {
        let device_id = self
            .attempt
            .as_ref()
            .map(|attempt| attempt.device_id.clone())
            .or_else(|| self.link.as_ref().map(|link| link.handles.device_id.clone()))
            .or_else(|| self.reconnect.as_ref().map(|r| r.device_id.clone()));

        ConnectionState {
            phase: self.phase(),
            radio: self.radio,
            device_id,
            notifications_ready: self.is_ready(),
            reconnect_attempts: self.reconnect_attempts,
            error: self.last_error.as_ref().map(ToString::to_string),
        }
    }

    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        let mut effects = Vec::new();
        match input {
            Input::RadioChanged(radio) => self.on_radio(radio, &mut effects),
            Input::Connect { device_id, origin } => {
                self.on_connect(device_id, origin, &mut effects)
            }
            Input::ConnectIssued { generation, result } => {
                if let Err(e) = result {
                    if self.current_generation() == Some(generation) {
                        self.fail_attempt(e, &mut effects);
                    }
                }
            }
            Input::Connected { device_id } => self.on_connected(device_id, &mut effects),
            Input::SetupFinished { generation, result } => {
                self.on_setup_finished(generation, result, &mut effects)
            }
            Input::Disconnected { device_id } => self.on_disconnected(device_id, &mut effects),
            Input::WatchdogExpired { generation } => {
                let expired = self.attempt.as_ref().filter(|a| a.generation == generation);
                if let Some(attempt) = expired {
                    let err = RingError::ProtocolTimeout(TimeoutKind::Connect {
                        device_id: attempt.device_id.clone(),
                    });
                    warn!("Connect watchdog fired: {}", err);
                    self.fail_attempt(err, &mut effects);
                }
            }
            Input::ReconnectDue { epoch } => {
                if self.reconnect.as_ref().map(|r| r.epoch) == Some(epoch) {
                    if let Some(pending) = self.reconnect.take() {
                        info!(
                            "Reconnecting to {} (attempt {}/{})",
                            pending.device_id, self.reconnect_attempts, self.max_reconnect_attempts
                        );
                        self.on_connect(pending.device_id, ConnectOrigin::Auto, &mut effects);
                    }
                }
            }
            Input::Disconnect => self.on_user_disconnect(&mut effects),
            Input::ScanStarted => self.scanning = true,
            Input::ScanStopped => self.scanning = false,
        }
        effects
    }

    fn current_generation(&self) -> Option<u64> {
        self.attempt.as_ref().map(|attempt| attempt.generation)
    }

    fn on_radio(&mut self, radio: RadioState, effects: &mut Vec<Effect>) {
        if radio != self.radio {
            info!("Bluetooth state: {} -> {}", self.radio, radio);
        }
        self.radio = radio;
        if radio.is_powered_on() {
            return;
        }

        if self.reconnect.take().is_some() {
            effects.push(Effect::CancelReconnect);
        }
        if self.attempt.is_some() {
            self.fail_attempt(RingError::RadioOff(radio), effects);
        }
        if let Some(link) = self.link.take() {
            warn!("Bluetooth off, dropping link to {}", link.handles.device_id);
            effects.push(Effect::LinkLost {
                device_id: link.handles.device_id,
            });
        }
    }

    fn on_connect(&mut self, device_id: String, origin: ConnectOrigin, effects: &mut Vec<Effect>) {
        if !self.radio.is_powered_on() {
            effects.push(Effect::Reject(RingError::RadioOff(self.radio)));
            return;
        }

        if let Some(attempt) = self.attempt.as_mut() {
            if attempt.device_id == device_id {
                debug!("Joining in-flight connect to {}", device_id);
                // a manual reconnect takes over an automatic attempt with a fresh budget
                if origin == ConnectOrigin::Manual {
                    attempt.origin = ConnectOrigin::Manual;
                    self.reconnect_attempts = 0;
                    self.last_error = None;
                }
                effects.push(Effect::Join);
            } else {
                effects.push(Effect::Reject(RingError::ConnectionBusy {
                    in_flight: attempt.device_id.clone(),
                }));
            }
            return;
        }

        if let Some(link) = &self.link {
            if link.handles.device_id == device_id {
                effects.push(Effect::Ready);
                return;
            }
        }

        if self.reconnect.take().is_some() {
            effects.push(Effect::CancelReconnect);
        }

        let new_target = self.last_device.as_deref() != Some(device_id.as_str());
        match origin {
            ConnectOrigin::Manual => self.reconnect_attempts = 0,
            ConnectOrigin::User if new_target => self.reconnect_attempts = 0,
            _ => {}
        }

        if let Some(link) = self.link.take() {
            info!("Disconnecting {} before connecting to {}", link.handles.device_id, device_id);
            effects.push(Effect::IssueDisconnect {
                device_id: link.handles.device_id.clone(),
            });
            effects.push(Effect::LinkLost {
                device_id: link.handles.device_id,
            });
        }

        self.generation += 1;
        self.last_error = None;
        info!("Connecting to {} (generation {})", device_id, self.generation);
        self.attempt = Some(Attempt {
            device_id: device_id.clone(),
            generation: self.generation,
            origin,
            confirmed: false,
        });
        effects.push(Effect::IssueConnect {
            device_id,
            generation: self.generation,
        });
        effects.push(Effect::ArmWatchdog {
            generation: self.generation,
        });
    }

    fn on_connected(&mut self, device_id: String, effects: &mut Vec<Effect>) {
        if let Some(attempt) = self.attempt.as_mut().filter(|a| a.device_id == device_id) {
            if attempt.confirmed {
                return;
            }
            info!("Connected to {}, discovering services", device_id);
            attempt.confirmed = true;
            self.last_device = Some(device_id.clone());
            effects.push(Effect::StartSetup {
                device_id,
                generation: attempt.generation,
            });
            return;
        }

        if self.handles().map(|h| h.device_id.as_str()) == Some(device_id.as_str()) {
            return;
        }

        warn!("Unexpected connection from {}, disconnecting", device_id);
        effects.push(Effect::IssueDisconnect { device_id });
    }

    fn on_setup_finished(
        &mut self,
        generation: u64,
        result: Result<GattHandles, RingError>,
        effects: &mut Vec<Effect>,
    ) {
        let current = self
            .attempt
            .as_ref()
            .is_some_and(|a| a.generation == generation && a.confirmed);
        if !current {
            debug!("Ignoring setup result for stale generation {}", generation);
            return;
        }

        match result {
            Ok(handles) => {
                self.attempt = None;
                info!("Ring {} ready", handles.device_id);
                effects.push(Effect::CancelWatchdog);
                effects.push(Effect::RememberDevice(handles.device_id.clone()));
                self.reconnect_attempts = 0;
                self.last_error = None;
                self.link = Some(Link { generation, handles });
                effects.push(Effect::Settle(Ok(())));
            }
            Err(e) => self.fail_attempt(e, effects),
        }
    }

    fn on_disconnected(&mut self, device_id: Option<String>, effects: &mut Vec<Effect>) {
        let link_matches = self.link.as_ref().is_some_and(|link| {
            device_id
                .as_deref()
                .map_or(true, |id| id == link.handles.device_id)
        });
        if link_matches {
            if let Some(link) = self.link.take() {
                let lost = link.handles.device_id;
                warn!("Link to {} lost (generation {})", lost, link.generation);
                effects.push(Effect::LinkLost {
                    device_id: lost.clone(),
                });
                self.schedule_reconnect(lost, effects);
            }
            return;
        }

        let attempt_matches = self.attempt.as_ref().is_some_and(|attempt| {
            device_id
                .as_deref()
                .map_or(attempt.confirmed, |id| id == attempt.device_id)
        });
        if attempt_matches {
            self.fail_attempt(
                RingError::Adapter("device disconnected while connecting".to_string()),
                effects,
            );
            return;
        }

        debug!("Ignoring disconnect of {:?}", device_id);
    }

    fn on_user_disconnect(&mut self, effects: &mut Vec<Effect>) {
        if self.reconnect.take().is_some() {
            effects.push(Effect::CancelReconnect);
        }
        if let Some(attempt) = self.attempt.take() {
            effects.push(Effect::CancelWatchdog);
            effects.push(Effect::Settle(Err(RingError::Cancelled)));
            effects.push(Effect::IssueDisconnect {
                device_id: attempt.device_id,
            });
        }
        if let Some(link) = self.link.take() {
            effects.push(Effect::IssueDisconnect {
                device_id: link.handles.device_id.clone(),
            });
            effects.push(Effect::LinkLost {
                device_id: link.handles.device_id,
            });
        }
        self.reconnect_attempts = 0;
        self.last_error = None;
    }

    /// End the in-flight attempt with `err` and release the lock.
    fn fail_attempt(&mut self, err: RingError, effects: &mut Vec<Effect>) {
        let Some(attempt) = self.attempt.take() else {
            return;
        };
        warn!("Connection to {} failed: {}", attempt.device_id, err);

        effects.push(Effect::CancelWatchdog);
        effects.push(Effect::Settle(Err(err.clone())));
        // the native layer may still be connecting, or connected mid-setup
        if !matches!(err, RingError::RadioOff(_)) {
            effects.push(Effect::IssueDisconnect {
                device_id: attempt.device_id.clone(),
            });
        }
        self.last_error = Some(err);

        if attempt.origin == ConnectOrigin::Auto {
            self.schedule_reconnect(attempt.device_id, effects);
        }
    }

    fn schedule_reconnect(&mut self, device_id: String, effects: &mut Vec<Effect>) {
        if !self.radio.is_powered_on() {
            return;
        }

        if self.reconnect_attempts >= self.max_reconnect_attempts {
            warn!(
                "Giving up on {} after {} reconnect attempts",
                device_id, self.reconnect_attempts
            );
            self.last_error = Some(RingError::ReconnectExhausted {
                attempts: self.reconnect_attempts,
            });
            return;
        }

        self.reconnect_attempts += 1;
        self.epoch += 1;
        self.reconnect = Some(PendingReconnect {
            device_id,
            epoch: self.epoch,
        });
        effects.push(Effect::ScheduleReconnect {
            epoch: self.epoch,
            delay: self.reconnect_delay,
        });
    }
}
