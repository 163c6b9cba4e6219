//! Wire protocol for the glasses.
//!
//! This module contains the low-level protocol types including:
//! - Opcodes
//! - Frames and fragmentation
//! - Frame builders with their sequence counters
//! - Notification documents

pub mod codec;
pub mod command;
pub mod frame;
pub mod notification;

pub use codec::{
    NOTIFICATION_CAPACITY, ProtocolCodec, TEXT_CAPACITY, TextLayout, WeatherUpdate,
};
pub use command::{DashboardMode, DashboardSubcommand, Opcode};
pub use frame::{FragmentedMessage, Frame, fragment, fragment_count, hex_line};
pub use notification::Notification;
