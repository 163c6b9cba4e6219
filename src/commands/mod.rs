//! High-level commands accepted by the supervisor.
//!
//! A command arrives as a name plus an optional JSON payload, is parsed into a
//! [`Command`], and is then either encoded into wire frames or applied to
//! in-memory state only.

use std::fmt;
use std::time::SystemTime;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::protocol::{DashboardMode, Frame, Notification, ProtocolCodec, TextLayout, WeatherUpdate};

/// Music transport actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MusicAction {
    /// Start playback.
    Play,
    /// Pause playback.
    Pause,
    /// Skip forward.
    Next,
    /// Skip back.
    Prev,
}

/// Playback state driven by [`Command::MusicControl`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MusicState {
    /// Playback is running.
    pub is_playing: bool,
    /// Current track title.
    pub track: String,
    /// Current artist.
    pub artist: String,
}

impl Default for MusicState {
    fn default() -> Self {
        Self {
            is_playing: false,
            track: "Midnight City".to_owned(),
            artist: "M83".to_owned(),
        }
    }
}

impl MusicState {
    /// Applies `action`. Skipping picks a placeholder track number.
    pub fn apply<R: Rng>(&mut self, action: MusicAction, rng: &mut R) {
        match action {
            MusicAction::Play => self.is_playing = true,
            MusicAction::Pause => self.is_playing = false,
            MusicAction::Next => self.track = format!("New Track {}", rng.gen_range(0..100)),
            MusicAction::Prev => self.track = format!("Prev Track {}", rng.gen_range(0..100)),
        }
    }
}

/// A parsed command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Set display brightness on the 0–100 UI scale.
    SetBrightness { percent: u8 },
    /// Show free text.
    SendText { text: String },
    /// Clear the display.
    ClearScreen,
    /// Turn the microphone on or off.
    Microphone { enable: bool },
    /// Push clock and weather to the dashboard.
    UpdateWeather(WeatherUpdate),
    /// Mirror a notification.
    SendNotification(Notification),
    /// Select the dashboard layout.
    SetDashboardMode(DashboardMode),
    /// Silence notifications.
    SetSilentMode { enabled: bool },
    /// Control music playback.
    MusicControl(MusicAction),
    /// UI-only command forwarded for state and logging.
    Ui { name: String, payload: Option<Value> },
}

#[derive(Deserialize)]
struct WeatherPayload {
    icon: u8,
    temp: f64,
    #[serde(default)]
    fahrenheit: bool,
    #[serde(default, alias = "twelveHour")]
    twelve_hour: bool,
}

fn require<'a>(command: &str, payload: Option<&'a Value>) -> Result<&'a Value> {
    payload
        .filter(|v| !v.is_null())
        .ok_or_else(|| Error::invalid_payload(command, "missing payload"))
}

fn deserialize<T: for<'de> Deserialize<'de>>(command: &str, payload: Option<&Value>) -> Result<T> {
    T::deserialize(require(command, payload)?)
        .map_err(|e| Error::invalid_payload(command, e.to_string()))
}

#[allow(clippy::cast_sign_loss)]
fn percent(command: &str, payload: Option<&Value>) -> Result<u8> {
    let value = require(command, payload)?
        .as_f64()
        .ok_or_else(|| Error::invalid_payload(command, "expected a number"))?;
    if !(0.0..=100.0).contains(&value) {
        return Err(Error::invalid_payload(
            command,
            format!("{value} is outside 0..=100"),
        ));
    }
    Ok(value.round() as u8)
}

#[allow(clippy::cast_possible_wrap)]
fn temperature(temp: f64) -> i8 {
    temp.round().clamp(f64::from(i8::MIN), f64::from(i8::MAX)) as i8
}

impl Command {
    /// Parses a command name and its payload.
    pub fn parse(name: &str, payload: Option<&Value>) -> Result<Self> {
        let command = match name {
            "SET_BRIGHTNESS" => Self::SetBrightness {
                percent: percent(name, payload)?,
            },
            "SEND_TEXT" | "TELEPROMPTER_INIT" => {
                let text = require(name, payload)?
                    .as_str()
                    .ok_or_else(|| Error::invalid_payload(name, "expected a string"))?;
                if text.is_empty() {
                    return Err(Error::invalid_payload(name, "text is empty"));
                }
                Self::SendText {
                    text: text.to_owned(),
                }
            }
            "CLEAR_SCREEN" | "TELEPROMPTER_CLEAR" => Self::ClearScreen,
            "START_VOICE_CAPTURE" => Self::Microphone { enable: true },
            "STOP_VOICE_CAPTURE" => Self::Microphone { enable: false },
            "UPDATE_WEATHER" => {
                let w: WeatherPayload = deserialize(name, payload)?;
                Self::UpdateWeather(WeatherUpdate {
                    icon: w.icon,
                    temperature: temperature(w.temp),
                    fahrenheit: w.fahrenheit,
                    twelve_hour: w.twelve_hour,
                })
            }
            "SEND_NOTIFICATION" => {
                let notification: Notification = deserialize(name, payload)?;
                if notification.message.is_empty() {
                    return Err(Error::invalid_payload(name, "message is empty"));
                }
                Self::SendNotification(notification)
            }
            "SET_DASHBOARD_MODE" => {
                let id = require(name, payload)?
                    .as_u64()
                    .and_then(|id| u8::try_from(id).ok())
                    .and_then(DashboardMode::from_byte)
                    .ok_or_else(|| Error::invalid_payload(name, "expected 0, 1 or 2"))?;
                Self::SetDashboardMode(id)
            }
            "SET_SILENT_MODE" => Self::SetSilentMode {
                enabled: require(name, payload)?
                    .as_bool()
                    .ok_or_else(|| Error::invalid_payload(name, "expected a boolean"))?,
            },
            "MUSIC_CONTROL" => Self::MusicControl(deserialize(name, payload)?),
            "CHECKLIST_OPEN" | "WEBVIEW_SHOW" => Self::Ui {
                name: name.to_owned(),
                payload: payload.cloned(),
            },
            _ => {
                return Err(Error::UnknownCommand {
                    name: name.to_owned(),
                });
            }
        };
        Ok(command)
    }

    /// Returns the canonical command name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::SetBrightness { .. } => "SET_BRIGHTNESS",
            Self::SendText { .. } => "SEND_TEXT",
            Self::ClearScreen => "CLEAR_SCREEN",
            Self::Microphone { enable: true } => "START_VOICE_CAPTURE",
            Self::Microphone { enable: false } => "STOP_VOICE_CAPTURE",
            Self::UpdateWeather(_) => "UPDATE_WEATHER",
            Self::SendNotification(_) => "SEND_NOTIFICATION",
            Self::SetDashboardMode(_) => "SET_DASHBOARD_MODE",
            Self::SetSilentMode { .. } => "SET_SILENT_MODE",
            Self::MusicControl(_) => "MUSIC_CONTROL",
            Self::Ui { name, .. } => name,
        }
    }

    /// Encodes the command into the frames to write, in order.
    ///
    /// Returns `None` for commands with no wire mapping.
    pub fn encode(&self, codec: &ProtocolCodec, now: SystemTime) -> Result<Option<Vec<Frame>>> {
        let frames = match self {
            Self::SetBrightness { percent } => vec![ProtocolCodec::brightness(*percent, false)],
            Self::SendText { text } => codec.text(text, TextLayout::default())?.into_frames(),
            Self::ClearScreen => vec![ProtocolCodec::clear()],
            Self::Microphone { enable } => vec![ProtocolCodec::microphone(*enable)],
            Self::UpdateWeather(weather) => vec![ProtocolCodec::time_and_weather(weather, now)],
            Self::SendNotification(n) => codec.notification(n, now)?.into_frames(),
            Self::SetDashboardMode(mode) => vec![ProtocolCodec::dashboard_mode(*mode)],
            Self::SetSilentMode { .. } | Self::MusicControl(_) | Self::Ui { .. } => {
                return Ok(None);
            }
        };
        Ok(Some(frames))
    }

    /// Returns the line logged for a simulated transmission.
    #[must_use]
    pub fn mock_line(&self) -> String {
        match self {
            Self::SetBrightness { percent } => format!(
                "[01] {:02X} 00 (Set Brightness: {percent}%)",
                ProtocolCodec::brightness_level(*percent)
            ),
            Self::SendText { .. } => "[0x4E] Sending Text Data...".to_owned(),
            other => format!("[MOCK] {}", other.name()),
        }
    }
}

/// Outcome string reported to bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// The command was delivered.
    Ok,
    /// The command failed.
    Error,
}

impl<T> From<&Result<T>> for CommandStatus {
    fn from(result: &Result<T>) -> Self {
        if result.is_ok() { Self::Ok } else { Self::Error }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "OK",
            Self::Error => "ERROR",
        })
    }
}
