//! Transport layer for glasses communication.
//!
//! Three interchangeable delivery mechanisms implement [`Transport`]:
//! - [`DirectLinkTransport`]: the platform BLE stack
//! - [`HostBridgeTransport`]: a string-only bridge into a host application
//! - [`SimulatedTransport`]: no I/O, for development and demos

pub mod bridge;
pub mod direct;
pub mod simulated;

use std::fmt;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::Frame;

/// Which delivery mechanism is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportMode {
    /// Native platform BLE stack.
    Direct,
    /// Host application bridge.
    HostBridge,
    /// Simulated glasses.
    Simulated,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Direct => "DirectLink",
            Self::HostBridge => "HostBridge",
            Self::Simulated => "Simulated",
        };
        f.write_str(name)
    }
}

/// What the host environment offers, gathered once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// A usable platform BLE stack is present.
    pub direct_link: bool,
    /// A host application bridge is installed.
    pub host_bridge: bool,
}

impl TransportMode {
    /// Picks a mode by ordered fallback: host bridge, then direct link, then simulation.
    ///
    /// A host that installs a bridge owns the physical radio, so the bridge
    /// wins even when a BLE stack is also visible.
    #[must_use]
    pub const fn probe(capabilities: Capabilities) -> Self {
        if capabilities.host_bridge {
            Self::HostBridge
        } else if capabilities.direct_link {
            Self::Direct
        } else {
            Self::Simulated
        }
    }

    /// Returns true for modes that talk to real hardware.
    #[must_use]
    pub const fn is_real(self) -> bool {
        !matches!(self, Self::Simulated)
    }
}

/// Events a transport reports upward to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Link established.
    Connected,
    /// Link lost or closed.
    Disconnected,
    /// Transport-level failure.
    Error(String),
    /// Raw bytes from the glasses.
    DataReceived(Bytes),
}

/// Channel transports push [`TransportEvent`]s into.
pub type EventSender = mpsc::Sender<TransportEvent>;

/// Trait for transport implementations.
pub trait Transport: Send + Sync {
    /// Returns the mode this transport implements.
    fn mode(&self) -> TransportMode;

    /// Connects to the glasses.
    fn connect(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Disconnects and releases any link handles.
    fn disconnect(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Writes one frame.
    fn write(&mut self, frame: Frame) -> BoxFuture<'_, Result<()>>;

    /// Returns true if connected.
    fn is_connected(&self) -> bool;

    /// Sets the channel that receives this transport's events.
    fn set_event_sender(&mut self, tx: EventSender);
}

/// Pushes an event without waiting; a full or closed channel drops it.
pub(crate) fn notify(tx: Option<&EventSender>, event: TransportEvent) {
    let Some(tx) = tx else {
        return;
    };
    if let Err(e) = tx.try_send(event) {
        tracing::debug!("transport event dropped: {}", e);
    }
}

pub use bridge::{BridgeCallbacks, BridgeConfig, BridgeEndpoint, HostBridge, HostBridgeTransport};
pub use direct::{BleDevice, BlePlatform, DirectLinkConfig, DirectLinkTransport, GattCharacteristic};
pub use simulated::{SimulatedConfig, SimulatedTransport};
