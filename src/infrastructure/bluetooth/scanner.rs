//! BLE Scanner Module
//!
//! Filtering and bookkeeping for ring discovery. The radio scan itself is
//! started by the manager; this module decides which reported peripherals
//! belong in the result.

use crate::domain::models::{AppEvent, DeviceDescriptor, MessageSeverity, StatusMessage};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::error::RingError;
use crate::infrastructure::bluetooth::protocol::parse_uuid;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Which peripherals a scan reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Case-insensitive substrings of the advertised name.
    pub name_patterns: Vec<String>,
    /// Advertised service UUIDs, any of which qualifies a device.
    pub service_uuids: Vec<Uuid>,
    /// Check bonded devices before (or instead of) a radio scan.
    pub include_bonded: bool,
}

impl ScanFilter {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            name_patterns: settings.scan_name_patterns.clone(),
            service_uuids: Vec::new(),
            include_bonded: settings.include_bonded_devices,
        }
    }

    pub fn by_name(patterns: &[&str]) -> Self {
        Self {
            name_patterns: patterns.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_service(mut self, uuid: &str) -> Result<Self, RingError> {
        self.service_uuids.push(parse_uuid(uuid)?);
        Ok(self)
    }

    pub fn with_bonded(mut self, include_bonded: bool) -> Self {
        self.include_bonded = include_bonded;
        self
    }

    /// A filter with no patterns and no UUIDs matches everything.
    pub fn matches(&self, device: &DeviceDescriptor) -> bool {
        if self.name_patterns.is_empty() && self.service_uuids.is_empty() {
            return true;
        }

        let name_match = device.name.as_deref().is_some_and(|name| {
            let name = name.to_lowercase();
            self.name_patterns
                .iter()
                .any(|pattern| name.contains(&pattern.to_lowercase()))
        });

        name_match
            || device
                .service_uuids
                .iter()
                .any(|uuid| self.service_uuids.contains(uuid))
    }
}

#[derive(Debug)]
struct ScanSession {
    id: u64,
    filter: ScanFilter,
    seen: HashSet<String>,
    devices: Vec<DeviceDescriptor>,
}

/// Bookkeeping for the single active scan.
pub struct BleScanner {
    session: Option<ScanSession>,
    next_id: u64,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl BleScanner {
    pub fn new(event_sender: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self {
            session: None,
            next_id: 0,
            event_sender,
        }
    }

    /// Open a scan session. Only one may run at a time.
    pub fn start(&mut self, filter: ScanFilter) -> Result<u64, RingError> {
        if self.session.is_some() {
            return Err(RingError::ScanInProgress);
        }

        self.next_id += 1;
        info!("Starting BLE scan {} ({:?})", self.next_id, filter.name_patterns);
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: "Scanning for rings...".to_string(),
            severity: MessageSeverity::Info,
        }));

        self.session = Some(ScanSession {
            id: self.next_id,
            filter,
            seen: HashSet::new(),
            devices: Vec::new(),
        });
        Ok(self.next_id)
    }

    /// Offer a discovered device to the active scan.
    ///
    /// Returns `true` when it matched the filter and was not seen before.
    pub fn offer(&mut self, device: DeviceDescriptor) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if !session.filter.matches(&device) || !session.seen.insert(device.id.clone()) {
            return false;
        }

        info!("Found ring: {} ({})", device.display_name(), device.id);
        let _ = self.event_sender.send(AppEvent::DeviceFound(device.clone()));
        session.devices.push(device);
        true
    }

    /// Close the scan identified by `scan_id` and return what it found.
    ///
    /// `None` if that scan is no longer the active one.
    pub fn finish(&mut self, scan_id: u64) -> Option<Vec<DeviceDescriptor>> {
        if self.session.as_ref().map(|session| session.id) != Some(scan_id) {
            return None;
        }
        let session = self.session.take()?;

        info!("Scan {} finished with {} device(s)", scan_id, session.devices.len());
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: format!("Scan finished: {} ring(s) found", session.devices.len()),
            severity: MessageSeverity::Info,
        }));
        Some(session.devices)
    }

    /// Drop the active scan without reporting its results.
    pub fn abort(&mut self) -> Option<u64> {
        let session = self.session.take()?;
        warn!("Scan {} aborted", session.id);
        Some(session.id)
    }

    pub fn current_id(&self) -> Option<u64> {
        self.session.as_ref().map(|session| session.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::SERVICE_UUID;

    fn device(id: &str, name: Option<&str>, uuids: Vec<Uuid>) -> DeviceDescriptor {
        DeviceDescriptor {
            id: id.to_string(),
            name: name.map(str::to_string),
            rssi: Some(-60),
            service_uuids: uuids,
            bonded: false,
        }
    }

    #[test]
    fn test_filter_matching() {
        let filter = ScanFilter::by_name(&["ring", "r02"]);
        assert!(filter.matches(&device("a", Some("Smart RING"), vec![])));
        assert!(filter.matches(&device("b", Some("R02_4F1A"), vec![])));
        assert!(!filter.matches(&device("c", Some("Headphones"), vec![])));
        assert!(!filter.matches(&device("d", None, vec![])));

        let filter = ScanFilter::default()
            .with_service("000002fd-3c17-d293-8e48-14fe2e4da212")
            .unwrap();
        assert!(filter.matches(&device("e", None, vec![SERVICE_UUID])));
        assert!(!filter.matches(&device("f", Some("ring"), vec![])));

        assert!(ScanFilter::default().matches(&device("g", None, vec![])));
    }

    #[test]
    fn test_session_dedupes_and_finishes_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scanner = BleScanner::new(tx);
        let id = scanner.start(ScanFilter::by_name(&["ring"])).unwrap();
        assert_eq!(scanner.start(ScanFilter::default()), Err(RingError::ScanInProgress));

        assert!(scanner.offer(device("a", Some("ring"), vec![])));
        assert!(!scanner.offer(device("a", Some("ring"), vec![])));
        assert!(!scanner.offer(device("b", Some("watch"), vec![])));

        assert_eq!(scanner.finish(id + 1), None);
        let devices = scanner.finish(id).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(scanner.current_id(), None);
        assert!(scanner.finish(id).is_none());

        let mut found = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, AppEvent::DeviceFound(_)) {
                found += 1;
            }
        }
        assert_eq!(found, 1);
    }

    #[test]
    fn test_offer_without_session_is_ignored() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut scanner = BleScanner::new(tx);
        assert!(!scanner.offer(device("a", Some("ring"), vec![])));
    }
}
