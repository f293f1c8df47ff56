//! Application services built on top of the ring manager.

pub mod ring_data;

pub use ring_data::{LiveHeartRate, RingDataService, RingSnapshot, SleepDate};
