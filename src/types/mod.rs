//! Data types shared across the crate.
//!
//! - Connection state and device vitals
//! - Diagnostic log entries

pub mod device;
pub mod log;

pub use device::{ConnectionState, DEFAULT_BRIGHTNESS, DeviceVitals};
pub use log::{DEFAULT_LOG_CAPACITY, LogBuffer, LogEntry, LogLevel, LogTag};
