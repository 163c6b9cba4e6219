//! Simulated glasses for development and demos.
//!
//! Connects after a fixed delay and accepts every write. Telemetry is
//! synthesized by [`seed_vitals`] and [`jitter`], driven by the supervisor.

use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;

use crate::error::Result;
use crate::event::LogSink;
use crate::protocol::Frame;
use crate::transport::{EventSender, Transport, TransportEvent, TransportMode, notify};
use crate::types::{DeviceVitals, LogTag};

/// Default delay before a simulated connect succeeds.
pub const DEFAULT_CONNECT_DELAY: Duration = Duration::from_millis(1500);

/// Default delay before the scripted voice transcript arrives.
pub const DEFAULT_VOICE_DELAY: Duration = Duration::from_secs(2);

/// Default scripted voice transcript.
pub const DEFAULT_VOICE_TRANSCRIPT: &str = "Moncchichi play music";

/// Signal strength the jitter oscillates around.
pub const BASE_RSSI: i16 = -58;

/// Maximum RSSI deviation per telemetry tick, in dBm.
const RSSI_NOISE: i16 = 2;

/// Configuration for the simulated transport.
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    /// Delay before connect succeeds.
    pub connect_delay: Duration,
    /// Delay between starting voice capture and the transcript.
    pub voice_delay: Duration,
    /// Transcript delivered after voice capture starts.
    pub voice_transcript: String,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            connect_delay: DEFAULT_CONNECT_DELAY,
            voice_delay: DEFAULT_VOICE_DELAY,
            voice_transcript: DEFAULT_VOICE_TRANSCRIPT.to_owned(),
        }
    }
}

impl SimulatedConfig {
    /// Sets the connect delay.
    #[must_use]
    pub const fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Sets the scripted voice transcript and its delay.
    #[must_use]
    pub fn voice(mut self, transcript: impl Into<String>, delay: Duration) -> Self {
        self.voice_transcript = transcript.into();
        self.voice_delay = delay;
        self
    }
}

/// Vitals reported right after a simulated connect.
#[must_use]
pub fn seed_vitals() -> DeviceVitals {
    DeviceVitals {
        battery_percent: Some(82),
        case_battery_percent: Some(95),
        firmware_version: Some("v1.6.6".to_owned()),
        signal_rssi: Some(BASE_RSSI),
        is_charging: false,
        is_worn: true,
        in_case: false,
        uptime_seconds: 1240,
        brightness: 75,
        silent_mode: false,
        left_lens_name: Some("G1_L_E4A1".to_owned()),
        right_lens_name: Some("G1_R_B2C9".to_owned()),
    }
}

/// Advances simulated vitals by one telemetry tick of length `elapsed`.
///
/// Signal strength is redrawn within ±2 dBm of [`BASE_RSSI`]; uptime grows by
/// `elapsed`. Everything else carries over.
#[must_use]
pub fn jitter<R: Rng>(vitals: &DeviceVitals, elapsed: Duration, rng: &mut R) -> DeviceVitals {
    let noise = rng.gen_range(-RSSI_NOISE..=RSSI_NOISE);
    DeviceVitals {
        signal_rssi: Some(BASE_RSSI + noise),
        uptime_seconds: vitals.uptime_seconds.saturating_add(elapsed.as_secs()),
        ..vitals.clone()
    }
}

/// Transport that performs no I/O.
pub struct SimulatedTransport {
    config: SimulatedConfig,
    log: LogSink,
    connected: bool,
    events: Option<EventSender>,
}

impl SimulatedTransport {
    /// Creates a simulated transport.
    #[must_use]
    pub const fn new(config: SimulatedConfig, log: LogSink) -> Self {
        Self {
            config,
            log,
            connected: false,
            events: None,
        }
    }
}

impl Transport for SimulatedTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Simulated
    }

    fn connect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.connected {
                return Ok(());
            }
            self.log.info(LogTag::Ble, "Simulating G1 Connection...");
            tokio::time::sleep(self.config.connect_delay).await;
            self.connected = true;
            self.log.info(LogTag::Ble, "Simulated Connection established");
            notify(self.events.as_ref(), TransportEvent::Connected);
            Ok(())
        })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if std::mem::replace(&mut self.connected, false) {
                self.log.warn(LogTag::Ble, "User initiated disconnect (Sim)");
            }
            Ok(())
        })
    }

    fn write(&mut self, frame: Frame) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.log
                .info(LogTag::Tx, format!("[MOCK] {}", frame.to_log_string()));
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn set_event_sender(&mut self, tx: EventSender) {
        self.events = Some(tx);
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tokio::sync::mpsc;

    use super::*;
    use crate::event::EventDispatcher;
    use crate::types::LogLevel;

    #[tokio::test(start_paused = true)]
    async fn test_connect_after_delay() {
        let log = LogSink::new(EventDispatcher::new(16), 16);
        let mut t = SimulatedTransport::new(SimulatedConfig::default(), log.clone());
        let (tx, mut rx) = mpsc::channel(4);
        t.set_event_sender(tx);

        let started = tokio::time::Instant::now();
        t.connect().await.unwrap();
        assert!(started.elapsed() >= DEFAULT_CONNECT_DELAY);
        assert!(t.is_connected());
        assert_eq!(rx.recv().await, Some(TransportEvent::Connected));

        t.write(Frame::from(vec![0x18])).await.unwrap();
        t.disconnect().await.unwrap();
        assert!(!t.is_connected());

        let messages: Vec<String> = log.recent().into_iter().map(|e| e.message).collect();
        assert_eq!(
            messages,
            [
                "Simulating G1 Connection...",
                "Simulated Connection established",
                "[MOCK] [1] 18",
                "User initiated disconnect (Sim)",
            ]
        );
        assert_eq!(log.recent()[3].level, LogLevel::Warn);
    }

    #[test]
    fn test_jitter_stays_near_base() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut vitals = seed_vitals();
        for _ in 0..100 {
            vitals = jitter(&vitals, Duration::from_secs(5), &mut rng);
            let rssi = vitals.signal_rssi.unwrap();
            assert!((BASE_RSSI - 2..=BASE_RSSI + 2).contains(&rssi));
        }
        assert_eq!(vitals.uptime_seconds, 1240 + 500);
        assert_eq!(vitals.battery_percent, Some(82));
        assert_eq!(vitals.brightness, 75);
    }
}
