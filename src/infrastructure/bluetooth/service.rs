//! Ring Manager
//!
//! Main service that coordinates scanning, connection, and request/response
//! handling for one ring.
//!
//! All mutable state lives in a single driver task. Caller commands, adapter
//! events, timer expiries and the results of adapter calls are all messages
//! on one queue, handled strictly in order. Adapter calls that may block are
//! spawned and report back through the same queue.

use crate::domain::models::{
    AppEvent, ConnectionState, DeviceDescriptor, MessageSeverity, RadioState, StatusMessage,
};
use crate::domain::settings::DeviceMemory;
use crate::infrastructure::bluetooth::adapter::{
    validate_peripheral, AdapterEvent, BleAdapter, RawAdapterEvent, RawPeripheral,
};
use crate::infrastructure::bluetooth::connection::{
    ConnectOrigin, ConnectionConfig, ConnectionMachine, Effect, GattHandles, Input,
};
use crate::infrastructure::bluetooth::correlator::{
    Correlator, Listener, ListenerId, NotificationRouter, Response, ResponseSender,
};
use crate::infrastructure::bluetooth::error::{RingError, TimeoutKind};
use crate::infrastructure::bluetooth::protocol::Frame;
use crate::infrastructure::bluetooth::reassembly::Reassembler;
use crate::infrastructure::bluetooth::scanner::{BleScanner, ScanFilter};
use crate::infrastructure::bluetooth::timer::Timer;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Upper bound on the best-effort disconnect during teardown
const TEARDOWN_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

type Reply<T> = oneshot::Sender<Result<T, RingError>>;

enum Command {
    Initialize {
        reply: Reply<RadioState>,
    },
    Scan {
        filter: ScanFilter,
        duration: Duration,
        reply: Reply<Vec<DeviceDescriptor>>,
    },
    Bonded {
        filter: ScanFilter,
        reply: Reply<Vec<DeviceDescriptor>>,
    },
    Connect {
        device_id: String,
        reply: Reply<()>,
    },
    Disconnect {
        clear_saved: bool,
        reply: Reply<()>,
    },
    Reconnect {
        reply: Reply<()>,
    },
    Send {
        opcode: u8,
        payload: Vec<u8>,
        reply: ResponseSender,
    },
    Subscribe {
        opcode: u8,
        listener: Listener,
        reply: oneshot::Sender<ListenerId>,
    },
    Unsubscribe {
        opcode: u8,
        id: ListenerId,
    },
    Destroy {
        reply: Option<oneshot::Sender<()>>,
    },
}

#[derive(Debug)]
enum TimerEvent {
    Watchdog { generation: u64 },
    RequestTimeout { opcode: u8, id: u64 },
    Reconnect { epoch: u64 },
    ScanComplete { scan_id: u64 },
}

/// Results of spawned adapter calls.
enum OpResult {
    Initialized {
        result: Result<RadioState, RingError>,
        reply: Reply<RadioState>,
    },
    ConnectIssued {
        generation: u64,
        result: Result<(), RingError>,
    },
    SetupFinished {
        generation: u64,
        result: Result<GattHandles, RingError>,
    },
    WriteFinished {
        opcode: u8,
        id: u64,
        result: Result<(), RingError>,
    },
    ScanStarted {
        scan_id: u64,
        result: Result<(), RingError>,
    },
    BondedListed {
        scan_id: u64,
        result: Result<Vec<RawPeripheral>, RingError>,
    },
}

enum Message {
    Command(Command),
    Adapter(AdapterEvent),
    Timer(TimerEvent),
    Op(OpResult),
}

/// Owned handle to one ring connection.
///
/// Dropping the manager tears it down the same way [`RingManager::destroy`]
/// does, without waiting for completion.
pub struct RingManager {
    commands: mpsc::UnboundedSender<Message>,
    state: watch::Receiver<ConnectionState>,
}

impl RingManager {
    /// Start the driver task. Must be called from within a tokio runtime.
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        config: ConnectionConfig,
        memory: Arc<dyn DeviceMemory>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());

        let forwarder = spawn_event_forwarder(adapter.subscribe(), tx.clone());
        let mut machine = ConnectionMachine::new(&config);
        if let Some(device_id) = memory.load() {
            debug!("Last connected ring: {}", device_id);
            machine.remember_last_device(device_id);
        }

        let driver = Driver {
            adapter,
            config,
            memory,
            machine,
            reassembler: Reassembler::default(),
            correlator: Correlator::new(),
            router: NotificationRouter::new(),
            scanner: BleScanner::new(event_sender.clone()),
            scan_reply: None,
            scan_timer: None,
            connect_waiters: Vec::new(),
            watchdog: None,
            reconnect_timer: None,
            self_tx: tx.clone(),
            state_tx,
            event_sender,
            forwarder,
        };
        tokio::spawn(driver.run(rx));

        Self {
            commands: tx,
            state: state_rx,
        }
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, RingError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Message::Command(build(tx)))
            .map_err(|_| RingError::ManagerDestroyed)?;
        rx.await.unwrap_or(Err(RingError::ManagerDestroyed))
    }

    /// Start the adapter and read the radio state.
    ///
    /// Fails with [`RingError::RadioOff`] unless Bluetooth is powered on.
    pub async fn initialize(&self) -> Result<RadioState, RingError> {
        self.request(|reply| Command::Initialize { reply }).await
    }

    /// Scan for `duration` and return every distinct match.
    pub async fn scan(
        &self,
        filter: ScanFilter,
        duration: Duration,
    ) -> Result<Vec<DeviceDescriptor>, RingError> {
        self.request(|reply| Command::Scan {
            filter,
            duration,
            reply,
        })
        .await
    }

    /// Bonded devices matching `filter`, without a radio scan.
    pub async fn bonded_devices(
        &self,
        filter: ScanFilter,
    ) -> Result<Vec<DeviceDescriptor>, RingError> {
        self.request(|reply| Command::Bonded { filter, reply }).await
    }

    /// Connect to the first matching ring.
    ///
    /// A bonded match short-circuits the radio scan.
    pub async fn find_and_connect(
        &self,
        filter: ScanFilter,
        duration: Duration,
    ) -> Result<DeviceDescriptor, RingError> {
        let mut device = None;
        if filter.include_bonded {
            device = self.bonded_devices(filter.clone()).await?.into_iter().next();
        }
        if device.is_none() {
            let scan_filter = filter.with_bonded(false);
            device = self.scan(scan_filter, duration).await?.into_iter().next();
        }

        let device = device.ok_or(RingError::NoDeviceFound)?;
        self.connect(&device.id).await?;
        Ok(device)
    }

    /// Connect and wait until notifications are enabled.
    pub async fn connect(&self, device_id: &str) -> Result<(), RingError> {
        let device_id = device_id.to_string();
        self.request(|reply| Command::Connect { device_id, reply }).await
    }

    /// Drop the link without reconnecting. `clear_saved` also forgets the
    /// device used by [`RingManager::reconnect`].
    pub async fn disconnect(&self, clear_saved: bool) -> Result<(), RingError> {
        self.request(|reply| Command::Disconnect { clear_saved, reply })
            .await
    }

    /// Reconnect to the last device, resetting the retry budget.
    pub async fn reconnect(&self) -> Result<(), RingError> {
        self.request(|reply| Command::Reconnect { reply }).await
    }

    /// Send a command and wait for its complete response.
    pub async fn send_command(
        &self,
        opcode: impl Into<u8>,
        payload: &[u8],
    ) -> Result<Response, RingError> {
        let opcode = opcode.into();
        let payload = payload.to_vec();
        self.request(|reply| Command::Send {
            opcode,
            payload,
            reply,
        })
        .await
    }

    /// Call `callback` for every unsolicited frame with `opcode`.
    pub async fn on_notification<F>(
        &self,
        opcode: impl Into<u8>,
        callback: F,
    ) -> Result<NotificationSubscription, RingError>
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        let opcode = opcode.into();
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Message::Command(Command::Subscribe {
                opcode,
                listener: Arc::new(callback),
                reply: tx,
            }))
            .map_err(|_| RingError::ManagerDestroyed)?;
        let id = rx.await.map_err(|_| RingError::ManagerDestroyed)?;

        Ok(NotificationSubscription {
            opcode,
            id,
            commands: self.commands.clone(),
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the ring is connected with notifications enabled.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), RingError> {
        let mut state = self.state.clone();
        let ready = tokio::time::timeout(timeout, async move {
            state.wait_for(ConnectionState::is_ready).await.map(|_| ())
        })
        .await;

        match ready {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RingError::ManagerDestroyed),
            Err(_) => Err(RingError::ProtocolTimeout(TimeoutKind::Connect {
                device_id: self
                    .connection_state()
                    .device_id
                    .unwrap_or_else(|| "unknown".to_string()),
            })),
        }
    }

    /// Reject everything pending, cancel timers and disconnect.
    pub async fn destroy(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Message::Command(Command::Destroy { reply: Some(tx) }))
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

impl Drop for RingManager {
    fn drop(&mut self) {
        let _ = self
            .commands
            .send(Message::Command(Command::Destroy { reply: None }));
    }
}

/// Registration returned by [`RingManager::on_notification`].
///
/// The listener stays registered until this is dropped or unsubscribed.
#[derive(Debug)]
pub struct NotificationSubscription {
    opcode: u8,
    id: ListenerId,
    commands: mpsc::UnboundedSender<Message>,
}

impl NotificationSubscription {
    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for NotificationSubscription {
    fn drop(&mut self) {
        let _ = self.commands.send(Message::Command(Command::Unsubscribe {
            opcode: self.opcode,
            id: self.id,
        }));
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command(_) => f.write_str("Command"),
            Self::Adapter(event) => write!(f, "Adapter({:?})", event),
            Self::Timer(event) => write!(f, "Timer({:?})", event),
            Self::Op(_) => f.write_str("Op"),
        }
    }
}

fn spawn_event_forwarder(
    mut events: broadcast::Receiver<RawAdapterEvent>,
    tx: mpsc::UnboundedSender<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(raw) => {
                    if let Some(event) = AdapterEvent::from_raw(raw) {
                        if tx.send(Message::Adapter(event)).is_err() {
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Adapter event stream lagged, {} events lost", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Adapter event stream closed");
                    break;
                }
            }
        }
    })
}

struct Driver {
    adapter: Arc<dyn BleAdapter>,
    config: ConnectionConfig,
    memory: Arc<dyn DeviceMemory>,
    machine: ConnectionMachine,
    reassembler: Reassembler,
    correlator: Correlator,
    router: NotificationRouter,
    scanner: BleScanner,
    scan_reply: Option<Reply<Vec<DeviceDescriptor>>>,
    scan_timer: Option<Timer>,
    /// Callers waiting on the in-flight connect attempt
    connect_waiters: Vec<Reply<()>>,
    watchdog: Option<Timer>,
    reconnect_timer: Option<Timer>,
    self_tx: mpsc::UnboundedSender<Message>,
    state_tx: watch::Sender<ConnectionState>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    forwarder: JoinHandle<()>,
}

impl Driver {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        info!("Ring manager started");
        while let Some(message) = rx.recv().await {
            trace!("Handling {:?}", message);
            match message {
                Message::Command(Command::Destroy { reply }) => {
                    self.teardown().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    break;
                }
                Message::Command(command) => self.on_command(command),
                Message::Adapter(event) => self.on_adapter_event(event),
                Message::Timer(event) => self.on_timer(event),
                Message::Op(result) => self.on_op_result(result),
            }
            self.publish();
        }
        info!("Ring manager stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Initialize { reply } => {
                let adapter = self.adapter.clone();
                self.spawn_op(async move {
                    let result: Result<RadioState, RingError> = async {
                        adapter.start().await?;
                        let state = adapter.radio_state().await?;
                        state.parse::<RadioState>().map_err(RingError::Adapter)
                    }
                    .await;
                    OpResult::Initialized { result, reply }
                });
            }
            Command::Scan {
                filter,
                duration,
                reply,
            } => self.start_scan(filter, duration, reply),
            Command::Bonded { filter, reply } => {
                let radio = self.machine.radio();
                if !radio.is_powered_on() {
                    let _ = reply.send(Err(RingError::RadioOff(radio)));
                    return;
                }
                let adapter = self.adapter.clone();
                tokio::spawn(async move {
                    let result = adapter.bonded_peripherals().await.map(|bonded| {
                        bonded
                            .into_iter()
                            .filter_map(|raw| validate_peripheral(raw, true).ok())
                            .filter(|device| filter.matches(device))
                            .collect()
                    });
                    let _ = reply.send(result);
                });
            }
            Command::Connect { device_id, reply } => {
                let effects = self.machine.handle(Input::Connect {
                    device_id,
                    origin: ConnectOrigin::User,
                });
                self.apply(effects, Some(reply));
            }
            Command::Disconnect { clear_saved, reply } => {
                info!("Disconnect requested (clear saved: {})", clear_saved);
                let effects = self.machine.handle(Input::Disconnect);
                self.apply(effects, None);
                if clear_saved {
                    self.memory.clear();
                    self.machine.forget_last_device();
                }
                self.send_log("Disconnected from ring", MessageSeverity::Info);
                let _ = reply.send(Ok(()));
            }
            Command::Reconnect { reply } => {
                let device_id = self
                    .machine
                    .last_device()
                    .map(str::to_string)
                    .or_else(|| self.memory.load());
                let Some(device_id) = device_id else {
                    let _ = reply.send(Err(RingError::NoSavedDevice));
                    return;
                };
                info!("Manual reconnect to {}", device_id);
                let effects = self.machine.handle(Input::Connect {
                    device_id,
                    origin: ConnectOrigin::Manual,
                });
                self.apply(effects, Some(reply));
            }
            Command::Send {
                opcode,
                payload,
                reply,
            } => self.send_command(opcode, &payload, reply),
            Command::Subscribe {
                opcode,
                listener,
                reply,
            } => {
                let id = self.router.subscribe(opcode, listener);
                debug!("Listener {:?} subscribed to opcode {:#04x}", id, opcode);
                let _ = reply.send(id);
            }
            Command::Unsubscribe { opcode, id } => {
                if self.router.unsubscribe(opcode, id) {
                    debug!("Listener {:?} unsubscribed from opcode {:#04x}", id, opcode);
                }
            }
            Command::Destroy { .. } => {}
        }
    }

    fn start_scan(
        &mut self,
        filter: ScanFilter,
        duration: Duration,
        reply: Reply<Vec<DeviceDescriptor>>,
    ) {
        let radio = self.machine.radio();
        if !radio.is_powered_on() {
            let _ = reply.send(Err(RingError::RadioOff(radio)));
            return;
        }

        let include_bonded = filter.include_bonded;
        let service_uuids = filter.service_uuids.clone();
        let scan_id = match self.scanner.start(filter) {
            Ok(scan_id) => scan_id,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        self.machine.handle(Input::ScanStarted);
        self.scan_reply = Some(reply);

        if include_bonded {
            let adapter = self.adapter.clone();
            self.spawn_op(async move {
                OpResult::BondedListed {
                    scan_id,
                    result: adapter.bonded_peripherals().await,
                }
            });
        }

        let adapter = self.adapter.clone();
        self.spawn_op(async move {
            OpResult::ScanStarted {
                scan_id,
                result: adapter.start_scan(&service_uuids, duration).await,
            }
        });
        self.scan_timer = Some(Timer::after(
            duration,
            self.self_tx.clone(),
            Message::Timer(TimerEvent::ScanComplete { scan_id }),
        ));
    }

    fn finish_scan(&mut self, scan_id: u64, result: Result<(), RingError>) {
        let devices = match result {
            Ok(()) => match self.scanner.finish(scan_id) {
                Some(devices) => Ok(devices),
                None => return,
            },
            Err(e) => {
                if self.scanner.current_id() != Some(scan_id) {
                    return;
                }
                self.scanner.abort();
                error!("Scan failed: {}", e);
                self.send_log(&format!("Scan failed: {}", e), MessageSeverity::Error);
                Err(e)
            }
        };

        self.scan_timer = None;
        self.machine.handle(Input::ScanStopped);
        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                debug!("stop_scan failed: {}", e);
            }
        });
        if let Some(reply) = self.scan_reply.take() {
            let _ = reply.send(devices);
        }
    }

    fn send_command(&mut self, opcode: u8, payload: &[u8], reply: ResponseSender) {
        let Some(handles) = self.machine.handles().cloned() else {
            let _ = reply.send(Err(RingError::NotConnected));
            return;
        };

        let frame = match Frame::encode(opcode, payload) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = reply.send(Err(RingError::outbound(opcode, e)));
                return;
            }
        };

        if self.correlator.is_pending(opcode) {
            let _ = reply.send(Err(RingError::RequestInFlight { opcode }));
            return;
        }

        self.reassembler.clear_buffer(opcode);
        let timeout = self.config.request_timeout;
        let timer_tx = self.self_tx.clone();
        let id = match self.correlator.register(opcode, reply, |id| {
            Timer::after(
                timeout,
                timer_tx,
                Message::Timer(TimerEvent::RequestTimeout { opcode, id }),
            )
        }) {
            Ok(id) => id,
            Err(_) => return,
        };

        debug!("TX {}", frame.to_hex());
        let adapter = self.adapter.clone();
        self.spawn_op(async move {
            let result = adapter
                .write(
                    &handles.device_id,
                    handles.service,
                    handles.write,
                    frame.as_bytes(),
                )
                .await;
            OpResult::WriteFinished { opcode, id, result }
        });
    }

    fn on_adapter_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::RadioChanged(radio) => {
                let effects = self.machine.handle(Input::RadioChanged(radio));
                if !radio.is_powered_on() {
                    self.send_log(
                        "Bluetooth is off. Turn it on to connect.",
                        MessageSeverity::Warning,
                    );
                }
                self.apply(effects, None);
            }
            AdapterEvent::Discovered(device) => {
                self.scanner.offer(device);
            }
            AdapterEvent::Connected { device_id } => {
                let effects = self.machine.handle(Input::Connected { device_id });
                self.apply(effects, None);
            }
            AdapterEvent::Disconnected { device_id } => {
                let effects = self.machine.handle(Input::Disconnected { device_id });
                self.apply(effects, None);
            }
            AdapterEvent::Notification {
                device_id,
                characteristic,
                value,
            } => self.on_notification(&device_id, characteristic, &value),
        }
    }

    fn on_notification(&mut self, device_id: &str, characteristic: uuid::Uuid, value: &[u8]) {
        let from_link = self
            .machine
            .handles()
            .is_some_and(|h| h.device_id == device_id && h.notify == characteristic);
        if !from_link {
            debug!("Ignoring notification from {} on {}", device_id, characteristic);
            return;
        }

        let frame = match Frame::decode(value) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed frame from {}: {}", device_id, e);
                return;
            }
        };
        trace!("RX {}", frame.to_hex());

        let opcode = frame.opcode();
        if self.correlator.is_pending(opcode) {
            if self.reassembler.process_packet(opcode, &frame) {
                return;
            }
            let packets = self.reassembler.take_complete(opcode).unwrap_or_default();
            self.correlator.resolve(Response {
                opcode,
                frame,
                packets,
            });
            return;
        }

        if self.router.dispatch(&frame) == 0 {
            debug!("No listener for opcode {:#04x}, dropping frame", opcode);
        }
    }

    fn on_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::Watchdog { generation } => {
                let effects = self.machine.handle(Input::WatchdogExpired { generation });
                self.apply(effects, None);
            }
            TimerEvent::RequestTimeout { opcode, id } => {
                let received = self.reassembler.buffer(opcode).map_or(0, |buffer| buffer.len());
                if self.correlator.expire(opcode, id) {
                    warn!(
                        "Request for opcode {:#04x} timed out after {} packet(s)",
                        opcode, received
                    );
                    self.reassembler.clear_buffer(opcode);
                }
            }
            TimerEvent::Reconnect { epoch } => {
                self.reconnect_timer = None;
                let effects = self.machine.handle(Input::ReconnectDue { epoch });
                self.apply(effects, None);
            }
            TimerEvent::ScanComplete { scan_id } => self.finish_scan(scan_id, Ok(())),
        }
    }

    fn on_op_result(&mut self, result: OpResult) {
        match result {
            OpResult::Initialized { result, reply } => match result {
                Ok(radio) => {
                    let effects = self.machine.handle(Input::RadioChanged(radio));
                    self.apply(effects, None);
                    if radio.is_powered_on() {
                        info!("Bluetooth ready");
                        let _ = reply.send(Ok(radio));
                    } else {
                        warn!("Bluetooth not available: {}", radio);
                        let _ = reply.send(Err(RingError::RadioOff(radio)));
                    }
                }
                Err(e) => {
                    error!("Failed to initialize adapter: {}", e);
                    let _ = reply.send(Err(e));
                }
            },
            OpResult::ConnectIssued { generation, result } => {
                let effects = self.machine.handle(Input::ConnectIssued { generation, result });
                self.apply(effects, None);
            }
            OpResult::SetupFinished { generation, result } => {
                let effects = self.machine.handle(Input::SetupFinished { generation, result });
                self.apply(effects, None);
            }
            OpResult::WriteFinished { opcode, id, result } => {
                if let Err(e) = result {
                    if self.correlator.pending_id(opcode) == Some(id) {
                        error!("Write for opcode {:#04x} failed: {}", opcode, e);
                        self.correlator.fail(opcode, e);
                        self.reassembler.clear_buffer(opcode);
                    }
                }
            }
            OpResult::ScanStarted { scan_id, result } => {
                if result.is_err() {
                    self.finish_scan(scan_id, result);
                }
            }
            OpResult::BondedListed { scan_id, result } => {
                if self.scanner.current_id() != Some(scan_id) {
                    return;
                }
                match result {
                    Ok(bonded) => {
                        for raw in bonded {
                            if let Ok(device) = validate_peripheral(raw, true) {
                                self.scanner.offer(device);
                            }
                        }
                    }
                    Err(e) => debug!("No bonded devices: {}", e),
                }
            }
        }
    }

    /// Carry out the machine's effects. `reply` belongs to the caller of
    /// the input that produced them, if any.
    fn apply(&mut self, effects: Vec<Effect>, mut reply: Option<Reply<()>>) {
        for effect in effects {
            match effect {
                Effect::Reject(e) => {
                    if let Some(reply) = reply.take() {
                        let _ = reply.send(Err(e));
                    }
                }
                Effect::Join => self.connect_waiters.extend(reply.take()),
                Effect::Ready => {
                    if let Some(reply) = reply.take() {
                        let _ = reply.send(Ok(()));
                    }
                }
                Effect::IssueConnect {
                    device_id,
                    generation,
                } => {
                    self.connect_waiters.extend(reply.take());
                    self.send_log(
                        &format!("Connecting to {}...", device_id),
                        MessageSeverity::Info,
                    );
                    let adapter = self.adapter.clone();
                    self.spawn_op(async move {
                        OpResult::ConnectIssued {
                            generation,
                            result: adapter.connect(&device_id).await,
                        }
                    });
                }
                Effect::ArmWatchdog { generation } => {
                    self.watchdog = Some(Timer::after(
                        self.config.connect_timeout,
                        self.self_tx.clone(),
                        Message::Timer(TimerEvent::Watchdog { generation }),
                    ));
                }
                Effect::CancelWatchdog => self.watchdog = None,
                Effect::StartSetup {
                    device_id,
                    generation,
                } => {
                    let adapter = self.adapter.clone();
                    let config = self.config.clone();
                    self.spawn_op(async move {
                        OpResult::SetupFinished {
                            generation,
                            result: setup_link(adapter, &device_id, &config).await,
                        }
                    });
                }
                Effect::IssueDisconnect { device_id } => {
                    let adapter = self.adapter.clone();
                    tokio::spawn(async move {
                        if let Err(e) = adapter.disconnect(&device_id).await {
                            debug!("Disconnect of {} failed: {}", device_id, e);
                        }
                    });
                }
                Effect::ScheduleReconnect { epoch, delay } => {
                    self.send_log(
                        &format!(
                            "Connection lost. Reconnecting (attempt {}/{})...",
                            self.machine.reconnect_attempts(),
                            self.config.max_reconnect_attempts
                        ),
                        MessageSeverity::Warning,
                    );
                    self.reconnect_timer = Some(Timer::after(
                        delay,
                        self.self_tx.clone(),
                        Message::Timer(TimerEvent::Reconnect { epoch }),
                    ));
                }
                Effect::CancelReconnect => self.reconnect_timer = None,
                Effect::Settle(result) => {
                    match &result {
                        Ok(()) => self.send_log("Ring connected", MessageSeverity::Success),
                        Err(e) => self.send_log(
                            &format!("Connection failed: {}", e),
                            MessageSeverity::Error,
                        ),
                    }
                    for waiter in self.connect_waiters.drain(..) {
                        let _ = waiter.send(result.clone());
                    }
                }
                Effect::LinkLost { device_id } => {
                    let rejected = self.correlator.reject_all(RingError::NotConnected);
                    if !rejected.is_empty() {
                        warn!(
                            "{} pending request(s) dropped with link to {}",
                            rejected.len(),
                            device_id
                        );
                    }
                    self.reassembler.clear_all();
                }
                Effect::RememberDevice(device_id) => self.memory.save(&device_id),
            }
        }
    }

    fn spawn_op<F>(&self, op: F)
    where
        F: Future<Output = OpResult> + Send + 'static,
    {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(Message::Op(op.await));
        });
    }

    /// Push the current snapshot to watchers when it changed.
    fn publish(&mut self) {
        let state = self.machine.snapshot();
        let previous = self.state_tx.borrow().clone();
        if state == previous {
            return;
        }

        if state.phase != previous.phase {
            info!("Connection phase: {:?} -> {:?}", previous.phase, state.phase);
            let _ = self.event_sender.send(AppEvent::ConnectionStatus(state.phase));
        }
        if state.error.is_some() && state.error != previous.error {
            if let Some(RingError::ReconnectExhausted { .. }) = self.machine.last_error() {
                self.send_log(
                    "Connection lost. Reconnect to try again.",
                    MessageSeverity::Error,
                );
            }
        }
        self.state_tx.send_replace(state);
    }

    async fn teardown(&mut self) {
        info!("Destroying ring manager");
        let rejected = self.correlator.reject_all(RingError::ManagerDestroyed);
        debug!("Rejected {} pending request(s)", rejected.len());
        self.reassembler.clear_all();
        self.router.clear();

        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(RingError::ManagerDestroyed));
        }
        if let Some(scan_id) = self.scanner.abort() {
            debug!("Scan {} cancelled by teardown", scan_id);
        }
        if let Some(reply) = self.scan_reply.take() {
            let _ = reply.send(Err(RingError::ManagerDestroyed));
        }
        self.scan_timer = None;

        let effects = self.machine.handle(Input::Disconnect);
        self.watchdog = None;
        self.reconnect_timer = None;
        for effect in effects {
            if let Effect::IssueDisconnect { device_id } = effect {
                match tokio::time::timeout(
                    TEARDOWN_DISCONNECT_TIMEOUT,
                    self.adapter.disconnect(&device_id),
                )
                .await
                {
                    Ok(Ok(())) => debug!("Disconnected {} on teardown", device_id),
                    Ok(Err(e)) => debug!("Teardown disconnect of {} failed: {}", device_id, e),
                    Err(_) => debug!("Teardown disconnect of {} timed out", device_id),
                }
            }
        }
        self.machine.handle(Input::ScanStopped);
        self.forwarder.abort();
        self.publish();
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

/// Settle delay, service discovery and notification enablement.
async fn setup_link(
    adapter: Arc<dyn BleAdapter>,
    device_id: &str,
    config: &ConnectionConfig,
) -> Result<GattHandles, RingError> {
    tokio::time::sleep(config.discovery_delay).await;
    let services = adapter.discover_services(device_id).await?;
    debug!("{} exposes {} service(s)", device_id, services.len());
    let handles = GattHandles::resolve(device_id, &services, config)?;
    adapter
        .enable_notifications(device_id, handles.service, handles.notify)
        .await?;
    info!("Notifications enabled on {}", handles.notify);
    Ok(handles)
}
