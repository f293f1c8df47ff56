//! High-level ring data access.
//!
//! Thin wrapper over [`RingManager`] that knows which opcode and payload
//! each kind of data needs. Responses are returned as reassembled packets;
//! turning them into health records is left to the caller.

use crate::domain::opcode::Opcode;
use crate::infrastructure::bluetooth::correlator::Response;
use crate::infrastructure::bluetooth::error::RingError;
use crate::infrastructure::bluetooth::protocol::Frame;
use crate::infrastructure::bluetooth::service::{NotificationSubscription, RingManager};
use std::sync::Arc;
use tracing::{info, warn};

/// A calendar day for sleep queries, sent as BCD `yy mm dd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepDate {
    year: u16,
    month: u8,
    day: u8,
}

impl SleepDate {
    /// `None` outside 2000-2099 or for an impossible month/day.
    pub fn new(year: u16, month: u8, day: u8) -> Option<Self> {
        let valid = (2000..=2099).contains(&year)
            && (1..=12).contains(&month)
            && (1..=31).contains(&day);
        valid.then_some(Self { year, month, day })
    }

    pub fn to_payload(self) -> [u8; 3] {
        [
            to_bcd((self.year - 2000) as u8),
            to_bcd(self.month),
            to_bcd(self.day),
        ]
    }
}

fn to_bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}

/// Everything [`RingDataService::fetch_all`] managed to read.
#[derive(Debug, Default, Clone)]
pub struct RingSnapshot {
    pub battery: Option<Response>,
    pub device_info: Option<Response>,
    pub heart_rate_history: Option<Response>,
    pub sleep: Option<Response>,
    pub blood_pressure: Option<Response>,
    pub hrv: Option<Response>,
    pub activity: Option<Response>,
}

impl RingSnapshot {
    pub fn fetched(&self) -> usize {
        [
            &self.battery,
            &self.device_info,
            &self.heart_rate_history,
            &self.sleep,
            &self.blood_pressure,
            &self.hrv,
            &self.activity,
        ]
        .iter()
        .filter(|r| r.is_some())
        .count()
    }
}

pub struct RingDataService {
    manager: Arc<RingManager>,
}

impl RingDataService {
    pub fn new(manager: Arc<RingManager>) -> Self {
        Self { manager }
    }

    pub async fn fetch_battery(&self) -> Result<Response, RingError> {
        self.manager.send_command(Opcode::GetBattery, &[]).await
    }

    pub async fn fetch_device_info(&self) -> Result<Response, RingError> {
        self.manager.send_command(Opcode::GetDeviceInfo, &[]).await
    }

    pub async fn fetch_heart_rate_history(&self) -> Result<Response, RingError> {
        self.manager.send_command(Opcode::ReadHeartRate, &[]).await
    }

    /// Sleep details for `date`, or whatever the ring reports by default.
    pub async fn fetch_sleep_details(
        &self,
        date: Option<SleepDate>,
    ) -> Result<Response, RingError> {
        let payload = date.map(SleepDate::to_payload);
        self.manager
            .send_command(Opcode::ReadSleepDetails, payload.as_ref().map_or(&[][..], |p| &p[..]))
            .await
    }

    pub async fn fetch_blood_pressure(&self) -> Result<Response, RingError> {
        self.manager.send_command(Opcode::ReadPressure, &[]).await
    }

    pub async fn fetch_hrv(&self) -> Result<Response, RingError> {
        self.manager.send_command(Opcode::Hrv, &[]).await
    }

    pub async fn fetch_activity(&self) -> Result<Response, RingError> {
        self.manager.send_command(Opcode::ReadTotalSportData, &[]).await
    }

    /// Read everything in turn. A failing item is logged and skipped.
    pub async fn fetch_all(&self) -> RingSnapshot {
        let mut snapshot = RingSnapshot {
            battery: keep("battery", self.fetch_battery().await),
            device_info: keep("device info", self.fetch_device_info().await),
            ..Default::default()
        };
        snapshot.heart_rate_history =
            keep("heart rate history", self.fetch_heart_rate_history().await);
        snapshot.sleep = keep("sleep", self.fetch_sleep_details(None).await);
        snapshot.blood_pressure = keep("blood pressure", self.fetch_blood_pressure().await);
        snapshot.hrv = keep("hrv", self.fetch_hrv().await);
        snapshot.activity = keep("activity", self.fetch_activity().await);

        info!("Fetched {}/7 data sets", snapshot.fetched());
        snapshot
    }

    /// Start live heart-rate monitoring.
    ///
    /// The listener is registered before the start command so the first
    /// reading is not missed.
    pub async fn start_live_heart_rate<F>(&self, on_reading: F) -> Result<LiveHeartRate, RingError>
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        let subscription = self
            .manager
            .on_notification(Opcode::RealTimeHeartRate, on_reading)
            .await?;
        self.manager.send_command(Opcode::StartHeartRate, &[]).await?;
        info!("Live heart rate started");

        Ok(LiveHeartRate {
            manager: self.manager.clone(),
            subscription,
        })
    }
}

fn keep(what: &str, result: Result<Response, RingError>) -> Option<Response> {
    match result {
        Ok(response) => Some(response),
        Err(e) => {
            warn!("Failed to fetch {}: {}", what, e);
            None
        }
    }
}

/// A running live heart-rate stream.
pub struct LiveHeartRate {
    manager: Arc<RingManager>,
    subscription: NotificationSubscription,
}

impl LiveHeartRate {
    /// Remove the listener and tell the ring to stop measuring.
    pub async fn stop(self) -> Result<(), RingError> {
        self.subscription.unsubscribe();
        let result = self
            .manager
            .send_command(Opcode::StopHeartRate, &[])
            .await
            .map(|_| ());
        if let Err(e) = &result {
            warn!("Failed to stop heart rate: {}", e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_date_payload_is_bcd() {
        let date = SleepDate::new(2024, 11, 5).unwrap();
        assert_eq!(date.to_payload(), [0x24, 0x11, 0x05]);
        assert_eq!(SleepDate::new(2031, 1, 31).unwrap().to_payload(), [0x31, 0x01, 0x31]);
    }

    #[test]
    fn test_sleep_date_bounds() {
        assert!(SleepDate::new(1999, 1, 1).is_none());
        assert!(SleepDate::new(2024, 13, 1).is_none());
        assert!(SleepDate::new(2024, 2, 0).is_none());
    }
}
