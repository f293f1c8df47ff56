use ring_link::application::RingDataService;
use ring_link::domain::models::{AppEvent, MessageSeverity};
use ring_link::domain::settings::{DeviceMemory, SettingsService};
use ring_link::infrastructure::bluetooth::simulated::SimulatedRing;
use ring_link::infrastructure::logging;
use ring_link::{ConnectionConfig, RingManager};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new().unwrap_or_else(|e| {
        eprintln!("Failed to locate settings ({}), using defaults", e);
        SettingsService::at("ring_link_settings.json")
    });

    let _log_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting Ring Link demo against a simulated ring");
    info!("Settings: {}", settings_service.path().display());

    let config = ConnectionConfig::from_settings(settings_service.get())?;
    let memory: Arc<dyn DeviceMemory> = Arc::new(Mutex::new(settings_service));

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                AppEvent::ConnectionStatus(phase) => info!("[status] {:?}", phase),
                AppEvent::DeviceFound(device) => {
                    info!("[found] {} {} rssi={:?}", device.display_name(), device.id, device.rssi)
                }
                AppEvent::LogMessage(msg) => match msg.severity {
                    MessageSeverity::Error => error!("[app] {}", msg.message),
                    MessageSeverity::Warning => warn!("[app] {}", msg.message),
                    _ => info!("[app] {}", msg.message),
                },
            }
        }
    });

    let ring = Arc::new(SimulatedRing::default());
    let manager = Arc::new(RingManager::new(ring, config.clone(), memory, event_tx));

    let radio = manager.initialize().await?;
    info!("Bluetooth: {}", radio);

    let scan_duration = config.scan_duration.min(Duration::from_secs(3));
    let device = manager
        .find_and_connect(config.scan_filter.clone(), scan_duration)
        .await?;
    info!("Connected to {} ({})", device.display_name(), device.id);

    let data = RingDataService::new(manager.clone());
    let snapshot = data.fetch_all().await;
    if let Some(packet) = snapshot.battery.as_ref().and_then(|b| b.packets.first()) {
        info!("Battery response: {:02X?}", &packet[..2]);
    }
    if let Some(history) = &snapshot.heart_rate_history {
        info!("Heart rate history: {} packet(s)", history.packets.len());
    }

    let live = data
        .start_live_heart_rate(|frame| info!("Live heart rate frame: {}", frame.to_hex()))
        .await?;
    tokio::time::sleep(Duration::from_secs(2)).await;
    live.stop().await?;

    manager.disconnect(false).await?;
    manager.destroy().await;
    info!("Done");
    Ok(())
}
