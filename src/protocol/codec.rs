//! Frame builders for every command the glasses understand.
//!
//! [`ProtocolCodec`] is pure apart from three wrapping one-byte counters: the
//! heartbeat sequence, the text sync id and the notification message id. A
//! counter advances once per logical message, never per fragment.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};

use crate::error::Result;
use crate::protocol::command::{DashboardMode, DashboardSubcommand};
use crate::protocol::frame::{FragmentedMessage, Frame, fragment};
use crate::protocol::notification::Notification;
use crate::protocol::Opcode;

/// Payload bytes per text fragment.
pub const TEXT_CAPACITY: usize = 191;

/// Header bytes per text fragment.
pub const TEXT_HEADER_LEN: usize = 9;

/// Payload bytes per notification fragment.
pub const NOTIFICATION_CAPACITY: usize = 176;

/// Header bytes per notification fragment.
pub const NOTIFICATION_HEADER_LEN: usize = 4;

/// Heartbeat frame length, also carried in its length field.
pub const HEARTBEAT_LEN: usize = 6;

/// Time-and-weather frame length, also carried in its length field.
pub const TIME_WEATHER_LEN: usize = 21;

/// Dashboard-mode frame length, also carried in its length field.
pub const DASHBOARD_MODE_LEN: usize = 7;

/// Highest brightness level the display accepts.
pub const MAX_BRIGHTNESS_LEVEL: u8 = 0x2A;

const HEARTBEAT_MARKER: u8 = 0x04;

/// Default text screen flags: new content (0x01) shown in text mode (0x30).
pub const DEFAULT_SCREEN_FLAGS: u8 = 0x01 | 0x30;

/// Placement of a text message on the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextLayout {
    /// Screen status flags.
    pub screen_flags: u8,
    /// Scroll position (big-endian on the wire).
    pub position: u16,
    /// Current page, 1-based.
    pub current_page: u8,
    /// Total pages.
    pub max_page: u8,
}

impl Default for TextLayout {
    fn default() -> Self {
        Self {
            screen_flags: DEFAULT_SCREEN_FLAGS,
            position: 0,
            current_page: 1,
            max_page: 1,
        }
    }
}

impl TextLayout {
    fn header(self) -> [u8; 5] {
        let [pos_hi, pos_lo] = self.position.to_be_bytes();
        [
            self.screen_flags,
            pos_hi,
            pos_lo,
            self.current_page,
            self.max_page,
        ]
    }
}

/// Weather widget contents sent together with the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WeatherUpdate {
    /// Firmware weather icon id.
    pub icon: u8,
    /// Temperature in the selected unit.
    pub temperature: i8,
    /// Display Fahrenheit instead of Celsius.
    pub fahrenheit: bool,
    /// Display a 12-hour clock.
    pub twelve_hour: bool,
}

/// Builds wire frames. Shared by reference; counters are atomic.
#[derive(Debug, Default)]
pub struct ProtocolCodec {
    heartbeat_seq: AtomicU8,
    text_seq: AtomicU8,
    notification_id: AtomicU8,
}

impl ProtocolCodec {
    /// Creates a codec with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the next heartbeat: `[0x25, 0x06, 0x00, seq, 0x04, seq]`.
    pub fn heartbeat(&self) -> Frame {
        let seq = self.heartbeat_seq.fetch_add(1, Ordering::Relaxed);
        Frame::from(vec![
            Opcode::Heartbeat.as_byte(),
            HEARTBEAT_LEN as u8,
            0x00,
            seq,
            HEARTBEAT_MARKER,
            seq,
        ])
    }

    /// Builds a microphone toggle: `[0x0E, enable]`.
    #[must_use]
    pub fn microphone(enable: bool) -> Frame {
        Frame::from(vec![Opcode::Microphone.as_byte(), u8::from(enable)])
    }

    /// Maps a 0–100 UI percentage onto the 0–42 device scale.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn brightness_level(ui_percent: u8) -> u8 {
        let level = (f64::from(ui_percent) / 100.0 * f64::from(MAX_BRIGHTNESS_LEVEL)).round();
        level.clamp(0.0, f64::from(MAX_BRIGHTNESS_LEVEL)) as u8
    }

    /// Builds a brightness frame from a UI percentage: `[0x01, level, auto]`.
    #[must_use]
    pub fn brightness(ui_percent: u8, auto: bool) -> Frame {
        Frame::from(vec![
            Opcode::Brightness.as_byte(),
            Self::brightness_level(ui_percent),
            u8::from(auto),
        ])
    }

    /// Builds the clear/exit frame: `[0x18]`.
    #[must_use]
    pub fn clear() -> Frame {
        Frame::from(vec![Opcode::Exit.as_byte()])
    }

    /// Builds the 21-byte clock and weather frame for the instant `now`.
    #[must_use]
    pub fn time_and_weather(weather: &WeatherUpdate, now: SystemTime) -> Frame {
        let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        let secs = u32::try_from(since_epoch.as_secs()).unwrap_or(u32::MAX);
        let millis = u64::try_from(since_epoch.as_millis()).unwrap_or(u64::MAX);

        let mut buf = BytesMut::with_capacity(TIME_WEATHER_LEN);
        buf.put_u8(Opcode::Dashboard.as_byte());
        buf.put_u8(TIME_WEATHER_LEN as u8);
        buf.put_u8(0x00);
        buf.put_u8(0x00); // seq
        buf.put_u8(DashboardSubcommand::TimeAndWeather as u8);
        buf.put_u32_le(secs);
        buf.put_u64_le(millis);
        buf.put_u8(weather.icon);
        buf.put_i8(weather.temperature);
        buf.put_u8(u8::from(weather.fahrenheit));
        buf.put_u8(u8::from(weather.twelve_hour));
        Frame::from_bytes(buf.freeze())
    }

    /// Builds a dashboard layout frame: `[0x06, 0x07, 0x00, 0x00, 0x06, mode, 0x00]`.
    #[must_use]
    pub fn dashboard_mode(mode: DashboardMode) -> Frame {
        Frame::from(vec![
            Opcode::Dashboard.as_byte(),
            DASHBOARD_MODE_LEN as u8,
            0x00,
            0x00,
            DashboardSubcommand::Mode as u8,
            mode as u8,
            0x00,
        ])
    }

    /// Splits UTF-8 text into `0x4E` fragments sharing the next sync id.
    pub fn text(&self, text: &str, layout: TextLayout) -> Result<FragmentedMessage> {
        let sync_id = self.text_seq.fetch_add(1, Ordering::Relaxed);
        let message = fragment(
            Opcode::Text,
            sync_id,
            &layout.header(),
            text.as_bytes(),
            TEXT_CAPACITY,
        )?;
        Ok(message)
    }

    /// Encodes a notification as JSON and splits it into `0x4B` fragments.
    pub fn notification(
        &self,
        notification: &Notification,
        now: SystemTime,
    ) -> Result<FragmentedMessage> {
        let msg_id = self.notification_id.fetch_add(1, Ordering::Relaxed);
        let time_s = now.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
        let json = notification.to_json(msg_id, time_s)?;
        let message = fragment(
            Opcode::Notification,
            msg_id,
            &[],
            &json,
            NOTIFICATION_CAPACITY,
        )?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_shape() {
        let codec = ProtocolCodec::new();
        for _ in 0..3 {
            let frame = codec.heartbeat();
            let b = frame.as_bytes();
            assert_eq!(b.len(), HEARTBEAT_LEN);
            assert_eq!(b[0], 0x25);
            assert_eq!(b[1], 0x06);
            assert_eq!(b[2], 0x00);
            assert_eq!(b[3], b[5]);
            assert_eq!(b[4], 0x04);
        }
    }

    #[test]
    fn test_heartbeat_sequence_wraps() {
        let codec = ProtocolCodec::new();
        let mut last = codec.heartbeat();
        for _ in 0..255 {
            last = codec.heartbeat();
        }
        assert_eq!(last.as_bytes()[3], 255);
        let next = codec.heartbeat();
        assert_eq!(next.as_bytes()[3], 0);
        assert_eq!(next.as_bytes()[5], 0);
    }

    #[test]
    fn test_brightness_mapping() {
        assert_eq!(ProtocolCodec::brightness_level(0), 0);
        assert_eq!(ProtocolCodec::brightness_level(50), 0x15);
        assert_eq!(ProtocolCodec::brightness_level(100), 0x2A);
        assert_eq!(ProtocolCodec::brightness_level(255), 0x2A);
        assert_eq!(
            ProtocolCodec::brightness(50, true).as_bytes(),
            &[0x01, 0x15, 0x01]
        );
    }

    #[test]
    fn test_simple_frames() {
        assert_eq!(ProtocolCodec::microphone(true).as_bytes(), &[0x0E, 0x01]);
        assert_eq!(ProtocolCodec::microphone(false).as_bytes(), &[0x0E, 0x00]);
        assert_eq!(ProtocolCodec::clear().as_bytes(), &[0x18]);
        assert_eq!(
            ProtocolCodec::dashboard_mode(DashboardMode::Minimal).as_bytes(),
            &[0x06, 0x07, 0x00, 0x00, 0x06, 0x02, 0x00]
        );
    }

    #[test]
    fn test_time_and_weather_layout() {
        let now = UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        let weather = WeatherUpdate {
            icon: 0x10,
            temperature: -5,
            fahrenheit: false,
            twelve_hour: true,
        };
        let frame = ProtocolCodec::time_and_weather(&weather, now);
        let b = frame.as_bytes();

        assert_eq!(b.len(), TIME_WEATHER_LEN);
        assert_eq!(&b[..5], &[0x06, 0x15, 0x00, 0x00, 0x01]);
        assert_eq!(&b[5..9], &1_700_000_000u32.to_le_bytes());
        assert_eq!(&b[9..17], &1_700_000_000_123u64.to_le_bytes());
        assert_eq!(b[17], 0x10);
        assert_eq!(i8::from_le_bytes([b[18]]), -5);
        assert_eq!(&b[19..], &[0x00, 0x01]);
    }

    #[test]
    fn test_text_single_fragment() {
        let codec = ProtocolCodec::new();
        let message = codec.text("Hello glasses", TextLayout::default()).unwrap();

        assert_eq!(message.len(), 1);
        let b = message.frames()[0].as_bytes();
        assert_eq!(b.len(), TEXT_HEADER_LEN + 13);
        assert_eq!(&b[..TEXT_HEADER_LEN], &[0x4E, 0, 1, 0, 0x31, 0, 0, 1, 1]);
        assert_eq!(&b[TEXT_HEADER_LEN..], b"Hello glasses");
    }

    #[test]
    fn test_text_sync_id_advances_per_message() {
        let codec = ProtocolCodec::new();
        let long = "x".repeat(TEXT_CAPACITY * 2 + 1);
        let first = codec.text(&long, TextLayout::default()).unwrap();
        let second = codec.text("short", TextLayout::default()).unwrap();

        assert_eq!(first.len(), 3);
        assert!(first.frames().iter().all(|f| f.as_bytes()[1] == 0));
        assert_eq!(second.sync_id(), 1);
    }

    #[test]
    fn test_text_position_is_big_endian() {
        let codec = ProtocolCodec::new();
        let layout = TextLayout {
            position: 0x0102,
            current_page: 2,
            max_page: 5,
            ..TextLayout::default()
        };
        let message = codec.text("a", layout).unwrap();
        assert_eq!(&message.frames()[0].as_bytes()[4..9], &[0x31, 0x01, 0x02, 2, 5]);
    }

    #[test]
    fn test_notification_fragments() {
        let codec = ProtocolCodec::new();
        let body = "b".repeat(300);
        let notification = Notification::new("app", "title", body);
        let now = UNIX_EPOCH + Duration::from_secs(1);
        let expected = notification.to_json(0, 1).unwrap();

        let message = codec.notification(&notification, now).unwrap();
        assert_eq!(message.len(), expected.len().div_ceil(NOTIFICATION_CAPACITY));

        let mut joined = Vec::new();
        for (index, frame) in message.frames().iter().enumerate() {
            let b = frame.as_bytes();
            assert_eq!(b[0], 0x4B);
            assert_eq!(b[1], 0);
            assert_eq!(usize::from(b[2]), message.len());
            assert_eq!(usize::from(b[3]), index);
            joined.extend_from_slice(&b[NOTIFICATION_HEADER_LEN..]);
        }
        assert_eq!(joined, expected);

        let next = codec.notification(&notification, now).unwrap();
        assert_eq!(next.sync_id(), 1);
    }

    #[test]
    fn test_notification_time_before_epoch_is_zero() {
        let codec = ProtocolCodec::new();
        let notification = Notification::new("app", "title", "body");
        let before = UNIX_EPOCH - Duration::from_secs(5);

        let message = codec.notification(&notification, before).unwrap();
        let joined: Vec<u8> = message
            .frames()
            .iter()
            .flat_map(|f| f.as_bytes()[NOTIFICATION_HEADER_LEN..].to_vec())
            .collect();
        assert_eq!(joined, notification.to_json(0, 0).unwrap());
    }
}
