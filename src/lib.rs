//! # glasslink
//!
//! Host-side control layer for BLE smart glasses.
//!
//! This library supervises one logical connection to a pair of glasses and
//! translates high-level commands into the vendor wire protocol.
//!
//! ## Features
//!
//! - Async/await based API using Tokio
//! - Three interchangeable transports: platform BLE, host application bridge
//!   and a simulator
//! - Frame builders with fragmentation for oversized payloads
//! - Periodic heartbeat and simulated telemetry
//! - Event feeds for state, vitals, logs, raw data, voice and music playback
//!
//! ## Quick Start
//!
//! ```no_run
//! use glasslink::{Backends, Supervisor, SupervisorConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), glasslink::Error> {
//!     // No backends: falls back to the simulator
//!     let glasses = Supervisor::probe(SupervisorConfig::default(), Backends::default())?;
//!     glasses.connect().await?;
//!
//!     glasses.send_command("SET_BRIGHTNESS", Some(json!(60))).await?;
//!     glasses.send_command("SEND_TEXT", Some(json!("Hello glasses"))).await?;
//!
//!     if let Some(vitals) = glasses.vitals() {
//!         println!("Battery: {:?}%", vitals.battery_percent);
//!     }
//!
//!     glasses.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`protocol`] - Opcodes, frames, fragmentation and frame builders
//! - [`types`] - Connection state, device vitals and log entries
//! - [`transport`] - Direct link, host bridge and simulated transports
//! - [`event`] - Async event system and the log sink
//! - [`commands`] - Command parsing and encoding
//! - [`client`] - High-level [`Supervisor`]

pub mod client;
pub mod commands;
pub mod error;
pub mod event;
pub mod protocol;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::{Backends, Supervisor, SupervisorConfig};
pub use commands::{Command, CommandStatus, MusicAction, MusicState};
pub use error::{CodecError, Error, Result};
pub use event::{Event, EventDispatcher, EventFilter, EventKind, LogSink, Subscription};
pub use protocol::{
    DashboardMode, FragmentedMessage, Frame, Notification, Opcode, ProtocolCodec, TextLayout,
    WeatherUpdate,
};
pub use transport::{
    BleDevice, BlePlatform, BridgeCallbacks, BridgeConfig, BridgeEndpoint, Capabilities,
    DirectLinkConfig, GattCharacteristic, HostBridge, SimulatedConfig, Transport, TransportEvent,
    TransportMode,
};
pub use types::{ConnectionState, DeviceVitals, LogEntry, LogLevel, LogTag};
