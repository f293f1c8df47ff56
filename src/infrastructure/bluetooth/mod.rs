//! Bluetooth Module
//!
//! Provides the frame protocol and connection management for the ring.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       RingManager                        │
//! │  (driver task - public API for the application)          │
//! └─────────────────────┬────────────────────────────────────┘
//!                       │ one message queue
//!       ┌───────────────┼───────────────┬──────────────┐
//!       │               │               │              │
//!       ▼               ▼               ▼              ▼
//! ┌───────────┐  ┌────────────┐  ┌────────────┐  ┌──────────┐
//! │  Scanner  │  │ Connection │  │ Correlator │  │ Protocol │
//! │           │  │            │  │            │  │          │
//! │ - filter  │  │ - lock     │  │ - pending  │  │ - frames │
//! │ - dedupe  │  │ - watchdog │  │ - timeouts │  │ - csum   │
//! │           │  │ - reconnect│  │ - routing  │  │ - reasm. │
//! └───────────┘  └────────────┘  └────────────┘  └──────────┘
//!                       │
//!                       ▼
//!               ┌───────────────┐
//!               │  BleAdapter   │  (native stack or SimulatedRing)
//!               └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Frame format, checksum and GATT identifiers
//! - [`reassembly`] - Multi-packet response reassembly
//! - [`correlator`] - Pending requests and notification listeners
//! - [`connection`] - Connection state machine and GATT handle resolution
//! - [`scanner`] - Scan filtering and de-duplication
//! - [`adapter`] - Adapter capability and boundary validation
//! - [`service`] - Main manager driving everything above

pub mod adapter;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod protocol;
pub mod reassembly;
pub mod scanner;
pub mod service;
pub mod simulated;
pub mod timer;

// Re-export main service for convenience
pub use error::{FrameError, RingError};
pub use service::{NotificationSubscription, RingManager};
