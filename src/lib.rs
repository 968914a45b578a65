pub mod alerts;
pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod ledger;
pub mod monitor;
pub mod notify;

pub use error::MonitorError;
