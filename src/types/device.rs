//! Connection state and device telemetry types.

use std::fmt;

use serde::Serialize;

/// Logical connection state, owned and mutated only by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No link.
    #[default]
    Disconnected,
    /// Connect attempt in flight.
    Connecting,
    /// Link established.
    Connected,
    /// Last connect attempt failed with a transport-reported error.
    Error,
    /// Reserved; never entered because nothing auto-reconnects.
    Reconnecting,
}

impl ConnectionState {
    /// Returns true if a new connect attempt may start from this state.
    #[must_use]
    pub const fn can_connect(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Error => "ERROR",
            Self::Reconnecting => "RECONNECTING",
        };
        f.write_str(name)
    }
}

/// Default UI brightness before the glasses report anything.
pub const DEFAULT_BRIGHTNESS: u8 = 50;

/// Device telemetry snapshot. Replaced wholesale on every update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceVitals {
    /// Glasses battery percentage.
    pub battery_percent: Option<u8>,
    /// Charging case battery percentage.
    pub case_battery_percent: Option<u8>,
    /// Firmware version string.
    pub firmware_version: Option<String>,
    /// Signal strength in dBm.
    pub signal_rssi: Option<i16>,
    /// Glasses are charging.
    pub is_charging: bool,
    /// Glasses are being worn.
    pub is_worn: bool,
    /// Glasses are in the case.
    pub in_case: bool,
    /// Seconds since the glasses booted.
    pub uptime_seconds: u64,
    /// Brightness on the 0–100 UI scale.
    pub brightness: u8,
    /// Notifications are silenced.
    pub silent_mode: bool,
    /// Left lens identifier.
    pub left_lens_name: Option<String>,
    /// Right lens identifier.
    pub right_lens_name: Option<String>,
}

impl Default for DeviceVitals {
    fn default() -> Self {
        Self {
            battery_percent: None,
            case_battery_percent: None,
            firmware_version: None,
            signal_rssi: None,
            is_charging: false,
            is_worn: false,
            in_case: false,
            uptime_seconds: 0,
            brightness: DEFAULT_BRIGHTNESS,
            silent_mode: false,
            left_lens_name: None,
            right_lens_name: None,
        }
    }
}
