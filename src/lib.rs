//! Protocol and connection layer for a BLE health ring.
//!
//! - [`infrastructure::bluetooth`]: frame codec, reassembly, connection
//!   state machine and the [`RingManager`] that drives them
//! - [`application`]: typed data fetches over the manager
//! - [`domain`]: shared models, the opcode table and persisted settings

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use domain::opcode::Opcode;
pub use infrastructure::bluetooth::{
    adapter::BleAdapter,
    connection::ConnectionConfig,
    correlator::Response,
    protocol::Frame,
    scanner::ScanFilter,
    FrameError, NotificationSubscription, RingError, RingManager,
};
