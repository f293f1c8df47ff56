use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "ring_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // GATT identifiers
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_write_uuid")]
    pub ble_write_char_uuid: String,
    #[serde(default = "default_notify_uuid")]
    pub ble_notify_char_uuid: String,

    // Scanning
    #[serde(default = "default_name_patterns")]
    pub scan_name_patterns: Vec<String>,
    #[serde(default = "default_scan_duration_ms")]
    pub scan_duration_ms: u64,
    #[serde(default = "default_true")]
    pub include_bonded_devices: bool,

    // Connection timing
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_discovery_delay_ms")]
    pub discovery_delay_ms: u64,

    // Reconnect policy
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    // Devices
    #[serde(default)]
    pub known_devices: Vec<String>,
    #[serde(default)]
    pub last_connected_device: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            ble_service_uuid: default_service_uuid(),
            ble_write_char_uuid: default_write_uuid(),
            ble_notify_char_uuid: default_notify_uuid(),
            scan_name_patterns: default_name_patterns(),
            scan_duration_ms: default_scan_duration_ms(),
            include_bonded_devices: true,
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            discovery_delay_ms: default_discovery_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            known_devices: Vec::new(),
            last_connected_device: None,
        }
    }
}

fn default_service_uuid() -> String {
    "000002fd-3c17-d293-8e48-14fe2e4da212".to_string()
}
fn default_write_uuid() -> String {
    "0000fd03-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_notify_uuid() -> String {
    "0000fd04-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_name_patterns() -> Vec<String> {
    ["ring", "r01", "r02", "r03", "r11"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_scan_duration_ms() -> u64 {
    10_000
}
fn default_connect_timeout_ms() -> u64 {
    15_000
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_discovery_delay_ms() -> u64 {
    500
}
fn default_max_reconnect_attempts() -> u32 {
    2
}
fn default_reconnect_delay_ms() -> u64 {
    2_000
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::at(settings_path))
    }

    /// Load settings from an explicit path, falling back to defaults.
    pub fn at(settings_path: impl Into<PathBuf>) -> Self {
        let settings_path = settings_path.into();
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("RingLink");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn remember_device(&mut self, device_id: &str) -> anyhow::Result<()> {
        if !self.settings.known_devices.iter().any(|d| d == device_id) {
            self.settings.known_devices.push(device_id.to_string());
        }
        self.settings.last_connected_device = Some(device_id.to_string());
        self.save()
    }

    pub fn forget_device(&mut self) -> anyhow::Result<()> {
        self.settings.last_connected_device = None;
        self.save()
    }
}

/// Persistence of the last connected ring, used by manual reconnect.
pub trait DeviceMemory: Send + Sync {
    fn load(&self) -> Option<String>;
    fn save(&self, device_id: &str);
    fn clear(&self);
}

impl DeviceMemory for Mutex<SettingsService> {
    fn load(&self) -> Option<String> {
        let settings = self.lock().unwrap_or_else(|e| e.into_inner());
        settings.get().last_connected_device.clone()
    }

    fn save(&self, device_id: &str) {
        let mut settings = self.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = settings.remember_device(device_id) {
            tracing::warn!("Failed to save last device {}: {}", device_id, e);
        }
    }

    fn clear(&self) {
        let mut settings = self.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = settings.forget_device() {
            tracing::warn!("Failed to clear last device: {}", e);
        }
    }
}

/// Non-persistent [`DeviceMemory`] for tests and one-shot sessions.
#[derive(Debug, Default)]
pub struct MemoryDeviceStore {
    device: Mutex<Option<String>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(device_id: &str) -> Self {
        Self {
            device: Mutex::new(Some(device_id.to_string())),
        }
    }
}

impl DeviceMemory for MemoryDeviceStore {
    fn load(&self) -> Option<String> {
        self.device.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn save(&self, device_id: &str) {
        *self.device.lock().unwrap_or_else(|e| e.into_inner()) = Some(device_id.to_string());
    }

    fn clear(&self) {
        *self.device.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_use_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "max_reconnect_attempts": 5 }"#).unwrap();
        assert_eq!(settings.max_reconnect_attempts, 5);
        assert_eq!(settings.request_timeout_ms, 10_000);
        assert_eq!(settings.scan_name_patterns.len(), 5);
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_remember_and_forget_device_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut service = SettingsService::at(&path);
        service.remember_device("AA:BB").unwrap();
        service.remember_device("AA:BB").unwrap();

        let reloaded = SettingsService::at(&path);
        assert_eq!(reloaded.get().last_connected_device.as_deref(), Some("AA:BB"));
        assert_eq!(reloaded.get().known_devices, vec!["AA:BB".to_string()]);

        let memory = Mutex::new(reloaded);
        assert_eq!(memory.load().as_deref(), Some("AA:BB"));
        memory.clear();
        assert_eq!(SettingsService::at(&path).get().last_connected_device, None);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryDeviceStore::new();
        assert_eq!(store.load(), None);
        store.save("ring-1");
        assert_eq!(store.load().as_deref(), Some("ring-1"));
        store.clear();
        assert_eq!(store.load(), None);
    }
}
