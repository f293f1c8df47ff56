//! Ring opcode table.
//!
//! Opcodes occupy byte 0 of every frame. Requests and their responses share
//! the same opcode; the top bit is reserved and cleared on the wire.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    GetDeviceInfo = 0x01,
    GetBattery = 0x03,
    ReadTotalSportData = 0x07,
    ReadBandSport = 0x13,
    ReadPressure = 0x14,
    ReadHeartRate = 0x15,
    /// Live heart-rate notifications while monitoring is running.
    RealTimeHeartRate = 0x1E,
    HrvSetting = 0x38,
    Hrv = 0x39,
    DeviceSupport = 0x3C,
    ReadSleepDetails = 0x44,
    TodaySportData = 0x48,
    StartHeartRate = 0x69,
    StopHeartRate = 0x6A,
    /// Catch-all housekeeping notification.
    DeviceNotify = 0x73,
}

impl Opcode {
    pub const ALL: [Opcode; 15] = [
        Self::GetDeviceInfo,
        Self::GetBattery,
        Self::ReadTotalSportData,
        Self::ReadBandSport,
        Self::ReadPressure,
        Self::ReadHeartRate,
        Self::RealTimeHeartRate,
        Self::HrvSetting,
        Self::Hrv,
        Self::DeviceSupport,
        Self::ReadSleepDetails,
        Self::TodaySportData,
        Self::StartHeartRate,
        Self::StopHeartRate,
        Self::DeviceNotify,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.code() == code)
    }

    /// Responses to these opcodes span several frames and go through the
    /// reassembler; everything else completes on its first frame.
    pub fn is_multi_packet(self) -> bool {
        matches!(
            self,
            Self::ReadHeartRate
                | Self::Hrv
                | Self::ReadPressure
                | Self::ReadSleepDetails
                | Self::ReadBandSport
        )
    }

    /// Records in this family end with a 0xFFFFFFFF timestamp.
    pub fn has_timestamp_sentinel(self) -> bool {
        self == Self::ReadPressure
    }

    pub fn multi_packet_codes() -> impl Iterator<Item = u8> {
        Self::ALL
            .into_iter()
            .filter(|op| op.is_multi_packet())
            .map(Opcode::code)
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        op.code()
    }
}
