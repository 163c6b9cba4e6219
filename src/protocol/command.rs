//! Opcodes for the glasses wire protocol.
//!
//! Every frame written to the glasses starts with one of these bytes,
//! optionally followed by parameters.

/// Opcodes sent to the glasses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Set display brightness (`[0x01, level, auto]`).
    Brightness = 0x01,
    /// Dashboard configuration, including time and weather (`0x06 ...`).
    Dashboard = 0x06,
    /// Enable or disable the microphone.
    Microphone = 0x0E,
    /// Clear the display / exit the current screen.
    Exit = 0x18,
    /// Keep-alive.
    Heartbeat = 0x25,
    /// Fragmented JSON notification.
    Notification = 0x4B,
    /// Fragmented free text.
    Text = 0x4E,
}

impl Opcode {
    /// Returns the opcode for a leading frame byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Brightness),
            0x06 => Some(Self::Dashboard),
            0x0E => Some(Self::Microphone),
            0x18 => Some(Self::Exit),
            0x25 => Some(Self::Heartbeat),
            0x4B => Some(Self::Notification),
            0x4E => Some(Self::Text),
            _ => None,
        }
    }

    /// Returns the raw byte value.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Sub-commands carried by [`Opcode::Dashboard`] frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DashboardSubcommand {
    /// Set clock and weather widget.
    TimeAndWeather = 0x01,
    /// Select dashboard layout.
    Mode = 0x06,
}

/// Dashboard layouts understood by the glasses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum DashboardMode {
    /// Full dashboard.
    #[default]
    Full = 0,
    /// Dual pane.
    Dual = 1,
    /// Minimal.
    Minimal = 2,
}

impl DashboardMode {
    /// Parses a dashboard mode from its numeric id.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Full),
            1 => Some(Self::Dual),
            2 => Some(Self::Minimal),
            _ => None,
        }
    }
}
