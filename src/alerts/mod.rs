//! Tamper Alerts
//!
//! Every detector reports through [`AlertRecorder`]: the alert is stored first, optionally
//! mirrored to disk, and only then sent out to voters.

pub mod recorder;

pub use recorder::{AlertRecorder, AlertSource};
