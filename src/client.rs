//! Main [`Supervisor`] implementation.
//!
//! The supervisor owns the single active transport, the connection state
//! machine and the device vitals. It schedules the periodic heartbeat (real
//! transports) or telemetry (simulation) task, routes commands through the
//! codec, and republishes everything to subscribers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::commands::{Command, MusicState};
use crate::error::{Error, Result};
use crate::event::{Event, EventDispatcher, EventFilter, LogSink, Subscription};
use crate::protocol::{Frame, ProtocolCodec};
use crate::transport::simulated::{jitter, seed_vitals};
use crate::transport::{
    BlePlatform, BridgeConfig, BridgeEndpoint, Capabilities, DirectLinkConfig,
    DirectLinkTransport, HostBridgeTransport, SimulatedConfig, SimulatedTransport, Transport,
    TransportEvent, TransportMode,
};
use crate::types::{ConnectionState, DEFAULT_LOG_CAPACITY, DeviceVitals, LogEntry, LogTag};

/// Default keep-alive interval on real transports.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Default telemetry interval in simulation.
pub const DEFAULT_TELEMETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Default pause between fragments of one message.
pub const DEFAULT_FRAGMENT_DELAY: Duration = Duration::from_millis(50);

/// Default artificial latency of a simulated command.
pub const DEFAULT_SIMULATED_COMMAND_DELAY: Duration = Duration::from_millis(150);

/// Default capacity of the event broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Heartbeat interval while connected over a real transport.
    pub heartbeat_interval: Duration,
    /// Telemetry interval while connected in simulation.
    pub telemetry_interval: Duration,
    /// Pause between successive fragments of one message.
    pub fragment_delay: Duration,
    /// Latency added to every simulated command.
    pub simulated_command_delay: Duration,
    /// Log entries kept for [`Supervisor::recent_logs`].
    pub log_capacity: usize,
    /// Capacity of event channels.
    pub event_capacity: usize,
    /// Direct link settings.
    pub direct: DirectLinkConfig,
    /// Host bridge settings.
    pub bridge: BridgeConfig,
    /// Simulation settings.
    pub simulated: SimulatedConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            telemetry_interval: DEFAULT_TELEMETRY_INTERVAL,
            fragment_delay: DEFAULT_FRAGMENT_DELAY,
            simulated_command_delay: DEFAULT_SIMULATED_COMMAND_DELAY,
            log_capacity: DEFAULT_LOG_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            direct: DirectLinkConfig::default(),
            bridge: BridgeConfig::default(),
            simulated: SimulatedConfig::default(),
        }
    }
}

impl SupervisorConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the simulated telemetry interval.
    #[must_use]
    pub const fn telemetry_interval(mut self, interval: Duration) -> Self {
        self.telemetry_interval = interval;
        self
    }

    /// Sets the inter-fragment delay.
    #[must_use]
    pub const fn fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = delay;
        self
    }

    /// Sets the simulated command latency.
    #[must_use]
    pub const fn simulated_command_delay(mut self, delay: Duration) -> Self {
        self.simulated_command_delay = delay;
        self
    }

    /// Sets the number of buffered log entries.
    #[must_use]
    pub const fn log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    /// Sets the direct link configuration.
    #[must_use]
    pub fn direct(mut self, config: DirectLinkConfig) -> Self {
        self.direct = config;
        self
    }

    /// Sets the host bridge configuration.
    #[must_use]
    pub const fn bridge(mut self, config: BridgeConfig) -> Self {
        self.bridge = config;
        self
    }

    /// Sets the simulation configuration.
    #[must_use]
    pub fn simulated(mut self, config: SimulatedConfig) -> Self {
        self.simulated = config;
        self
    }
}

/// Platform facilities available to the supervisor.
#[derive(Clone, Default)]
pub struct Backends {
    /// Platform BLE stack, if any.
    pub ble: Option<Arc<dyn BlePlatform>>,
    /// Host application bridge, if installed.
    pub bridge: Option<BridgeEndpoint>,
}

impl Backends {
    /// Adds a platform BLE stack.
    #[must_use]
    pub fn with_ble(mut self, platform: Arc<dyn BlePlatform>) -> Self {
        self.ble = Some(platform);
        self
    }

    /// Adds a host bridge.
    #[must_use]
    pub fn with_bridge(mut self, endpoint: BridgeEndpoint) -> Self {
        self.bridge = Some(endpoint);
        self
    }

    /// Probes what the backends can actually do.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            direct_link: self.ble.as_ref().is_some_and(|p| p.is_available()),
            host_bridge: self.bridge.is_some(),
        }
    }
}

struct Session {
    state: ConnectionState,
    mode: TransportMode,
    vitals: DeviceVitals,
    music: MusicState,
    attempt: u64,
    cancel: Option<oneshot::Sender<()>>,
    periodic: Option<JoinHandle<()>>,
    voice: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

impl Session {
    fn stop_tasks(&mut self) {
        for task in [self.periodic.take(), self.voice.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

struct Inner {
    config: SupervisorConfig,
    backends: Backends,
    codec: ProtocolCodec,
    dispatcher: EventDispatcher,
    log: LogSink,
    transport: tokio::sync::Mutex<Box<dyn Transport>>,
    session: Mutex<Session>,
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ConnectionState {
        self.session().state
    }

    fn vitals_event(vitals: &DeviceVitals) -> Event {
        Event::Vitals(Some(Box::new(vitals.clone())))
    }

    /// Moves to `next`, stopping periodic work on every exit from CONNECTED.
    fn transition(&self, s: &mut Session, next: ConnectionState) {
        if s.state == next {
            return;
        }
        let was_connected = s.state == ConnectionState::Connected;
        tracing::debug!("connection state {} -> {}", s.state, next);
        s.state = next;
        if was_connected {
            s.stop_tasks();
        }

        self.dispatcher.dispatch(Event::StateChanged(next));
        if next == ConnectionState::Connected {
            self.dispatcher.dispatch(Self::vitals_event(&s.vitals));
        } else if was_connected {
            self.dispatcher.dispatch(Event::Vitals(None));
        }
    }

    /// Cancels any pending connect and moves to DISCONNECTED.
    fn reset(&self, s: &mut Session) {
        if let Some(cancel) = s.cancel.take() {
            let _ = cancel.send(());
        }
        s.attempt = s.attempt.wrapping_add(1);
        self.transition(s, ConnectionState::Disconnected);
    }

    fn build_transport(
        config: &SupervisorConfig,
        backends: &Backends,
        log: &LogSink,
        mode: TransportMode,
    ) -> Result<Box<dyn Transport>> {
        let transport: Box<dyn Transport> = match mode {
            TransportMode::Direct => Box::new(DirectLinkTransport::new(
                backends.ble.clone(),
                config.direct.clone(),
                log.clone(),
            )),
            TransportMode::HostBridge => {
                let Some(endpoint) = backends.bridge.clone() else {
                    return Err(Error::Unavailable {
                        mode,
                        reason: "no host bridge installed".into(),
                    });
                };
                Box::new(HostBridgeTransport::new(
                    endpoint,
                    config.bridge.clone(),
                    log.clone(),
                ))
            }
            TransportMode::Simulated => Box::new(SimulatedTransport::new(
                config.simulated.clone(),
                log.clone(),
            )),
        };
        Ok(transport)
    }

    async fn on_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => tracing::debug!("transport reports link up"),
            TransportEvent::Error(reason) => tracing::debug!("transport error: {}", reason),
            TransportEvent::DataReceived(data) => {
                self.dispatcher.dispatch(Event::DataReceived(data));
            }
            TransportEvent::Disconnected => {
                let mut transport = self.transport.lock().await;
                if transport.is_connected() {
                    tracing::debug!("ignoring link-down report from an earlier link");
                    return;
                }
                let lost = {
                    let mut s = self.session();
                    let lost = s.state == ConnectionState::Connected;
                    if lost {
                        self.transition(&mut s, ConnectionState::Disconnected);
                    }
                    lost
                };
                if lost {
                    if let Err(e) = transport.disconnect().await {
                        tracing::debug!("releasing lost link failed: {}", e);
                    }
                }
            }
        }
    }

    async fn heartbeat(&self) {
        let mut transport = self.transport.lock().await;
        if self.state() != ConnectionState::Connected {
            return;
        }
        if let Err(e) = transport.write(self.codec.heartbeat()).await {
            tracing::debug!("heartbeat write failed: {}", e);
        }
    }

    fn telemetry_tick(&self, elapsed: Duration) {
        let mut s = self.session();
        if s.state != ConnectionState::Connected {
            return;
        }
        s.vitals = jitter(&s.vitals, elapsed, &mut rand::thread_rng());
        self.dispatcher.dispatch(Self::vitals_event(&s.vitals));
    }

    /// Writes frames in order under one transport lock.
    async fn write_frames(&self, name: &str, frames: Vec<Frame>) -> Result<()> {
        let mut transport = self.transport.lock().await;
        for (idx, frame) in frames.into_iter().enumerate() {
            if idx > 0 {
                tokio::time::sleep(self.config.fragment_delay).await;
            }
            if self.state() != ConnectionState::Connected {
                self.log.error(
                    LogTag::App,
                    format!("Cannot send {name}: Device disconnected"),
                );
                return Err(Error::NotConnected);
            }
            transport.write(frame).await?;
        }
        Ok(())
    }

    /// Applies the in-memory effect of a delivered command.
    fn apply(&self, command: &Command) {
        let mut s = self.session();
        let event = match command {
            Command::SetBrightness { percent } => {
                s.vitals.brightness = *percent;
                Self::vitals_event(&s.vitals)
            }
            Command::SetSilentMode { enabled } => {
                s.vitals.silent_mode = *enabled;
                Self::vitals_event(&s.vitals)
            }
            Command::MusicControl(action) => {
                s.music.apply(*action, &mut rand::thread_rng());
                Event::Music(s.music.clone())
            }
            _ => return,
        };
        if s.state == ConnectionState::Connected {
            self.dispatcher.dispatch(event);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let s = self
            .session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        s.stop_tasks();
        if let Some(pump) = s.pump.take() {
            pump.abort();
        }
    }
}

/// Ends a connect attempt that was dropped before it resolved.
struct AttemptGuard<'a> {
    inner: &'a Inner,
    attempt: u64,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        let mut s = self.inner.session();
        if s.attempt == self.attempt && s.state == ConnectionState::Connecting {
            s.cancel = None;
            self.inner.transition(&mut s, ConnectionState::Disconnected);
        }
    }
}

fn spawn_pump(inner: Weak<Inner>, mut events: mpsc::Receiver<TransportEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.on_transport_event(event).await;
        }
        tracing::trace!("transport event pump stopped");
    })
}

fn spawn_periodic(inner: Weak<Inner>, mode: TransportMode, period: Duration) -> JoinHandle<()> {
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if mode.is_real() {
                inner.heartbeat().await;
            } else {
                inner.telemetry_tick(period);
            }
        }
    })
}

/// Supervisor of the single logical connection to the glasses.
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Creates a supervisor using `mode`. Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unavailable`] if `mode` needs a backend that is missing.
    pub fn new(config: SupervisorConfig, backends: Backends, mode: TransportMode) -> Result<Self> {
        let dispatcher = EventDispatcher::new(config.event_capacity);
        let log = LogSink::new(dispatcher.clone(), config.log_capacity);

        let mut transport = Inner::build_transport(&config, &backends, &log, mode)?;
        let (tx, rx) = mpsc::channel(config.event_capacity.max(1));
        transport.set_event_sender(tx);

        let inner = Arc::new(Inner {
            config,
            backends,
            codec: ProtocolCodec::new(),
            dispatcher,
            log,
            transport: tokio::sync::Mutex::new(transport),
            session: Mutex::new(Session {
                state: ConnectionState::Disconnected,
                mode,
                vitals: DeviceVitals::default(),
                music: MusicState::default(),
                attempt: 0,
                cancel: None,
                periodic: None,
                voice: None,
                pump: None,
            }),
        });
        let pump = spawn_pump(Arc::downgrade(&inner), rx);
        inner.session().pump = Some(pump);

        Ok(Self { inner })
    }

    /// Creates a supervisor in the best mode the backends allow.
    ///
    /// Falls back to simulation, with a warning, when neither a host bridge
    /// nor a BLE stack is present.
    pub fn probe(config: SupervisorConfig, backends: Backends) -> Result<Self> {
        let mode = TransportMode::probe(backends.capabilities());
        let supervisor = Self::new(config, backends, mode)?;
        if mode == TransportMode::Simulated {
            supervisor.inner.log.warn(
                LogTag::Sys,
                "BLE capability unavailable, defaulting to Simulation",
            );
        } else {
            supervisor
                .inner
                .log
                .info(LogTag::Sys, format!("Using {mode} transport"));
        }
        Ok(supervisor)
    }

    /// Returns the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Returns the active transport mode.
    #[must_use]
    pub fn mode(&self) -> TransportMode {
        self.inner.session().mode
    }

    /// Returns the latest vitals, or `None` unless connected.
    #[must_use]
    pub fn vitals(&self) -> Option<DeviceVitals> {
        let s = self.inner.session();
        (s.state == ConnectionState::Connected).then(|| s.vitals.clone())
    }

    /// Returns the music playback state.
    #[must_use]
    pub fn music(&self) -> MusicState {
        self.inner.session().music.clone()
    }

    /// Returns what the configured backends can do.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.inner.backends.capabilities()
    }

    /// Returns the buffered log entries, oldest first.
    #[must_use]
    pub fn recent_logs(&self) -> Vec<LogEntry> {
        self.inner.log.recent()
    }

    /// Subscribes to events with an optional filter.
    #[must_use]
    pub fn subscribe(&self, filter: Option<EventFilter>) -> Subscription {
        self.inner.dispatcher.subscribe(filter)
    }

    /// Connects over the active transport.
    ///
    /// Resolves once the state has left CONNECTING. Already connected is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectInProgress`] if another attempt is pending
    /// - [`Error::Cancelled`] if [`disconnect`](Self::disconnect) or
    ///   [`set_mode`](Self::set_mode) interrupted the attempt
    /// - whatever the transport reported otherwise
    pub async fn connect(&self) -> Result<()> {
        let inner = &*self.inner;
        let (attempt, cancelled, mode) = {
            let mut s = inner.session();
            match s.state {
                ConnectionState::Connecting => return Err(Error::ConnectInProgress),
                ConnectionState::Connected => return Ok(()),
                _ => {}
            }
            let (tx, rx) = oneshot::channel();
            s.attempt = s.attempt.wrapping_add(1);
            s.cancel = Some(tx);
            inner.transition(&mut s, ConnectionState::Connecting);
            (s.attempt, rx, s.mode)
        };
        let _guard = AttemptGuard { inner, attempt };

        let outcome = tokio::select! {
            biased;
            _ = cancelled => None,
            outcome = async {
                let mut transport = inner.transport.lock().await;
                let result = transport.connect().await;
                (result, transport)
            } => Some(outcome),
        };
        let Some((mut result, transport)) = outcome else {
            return Err(Error::Cancelled);
        };
        // The link may already have dropped while the transport was setting up
        if result.is_ok() && !transport.is_connected() {
            inner
                .log
                .warn(LogTag::Ble, "Link lost before the connection was established");
            result = Err(Error::NotConnected);
        }

        // Settle the state before releasing the transport so a link-down
        // report queued behind us sees the final state
        let mut s = inner.session();
        if s.attempt != attempt || s.state != ConnectionState::Connecting {
            return Err(Error::Cancelled);
        }
        s.cancel = None;

        match result {
            Ok(()) => {
                if mode == TransportMode::Simulated {
                    s.vitals = seed_vitals();
                }
                inner.transition(&mut s, ConnectionState::Connected);
                let period = if mode.is_real() {
                    inner.config.heartbeat_interval
                } else {
                    inner.config.telemetry_interval
                };
                s.periodic = Some(spawn_periodic(Arc::downgrade(&self.inner), mode, period));
                Ok(())
            }
            Err(e) => {
                let next = if e.is_adapter_error() {
                    ConnectionState::Error
                } else {
                    ConnectionState::Disconnected
                };
                if matches!(e, Error::Cancelled) {
                    inner.log.info(LogTag::Ble, "Connection cancelled");
                }
                inner.transition(&mut s, next);
                Err(e)
            }
        }
    }

    /// Disconnects, cancelling any pending connect attempt.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.reset(&mut self.inner.session());
        let mut transport = self.inner.transport.lock().await;
        transport.disconnect().await
    }

    /// Replaces the active transport, disconnecting first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unavailable`] if `mode` needs a backend that is
    /// missing; the current transport stays in place.
    pub async fn set_mode(&self, mode: TransportMode) -> Result<()> {
        let inner = &*self.inner;
        let mut next = Inner::build_transport(&inner.config, &inner.backends, &inner.log, mode)?;

        inner.reset(&mut inner.session());
        let mut transport = inner.transport.lock().await;
        if let Err(e) = transport.disconnect().await {
            tracing::debug!("disconnecting {} failed: {}", transport.mode(), e);
        }

        let (tx, rx) = mpsc::channel(inner.config.event_capacity.max(1));
        next.set_event_sender(tx);
        *transport = next;
        let pump = spawn_pump(Arc::downgrade(&self.inner), rx);

        {
            let mut s = inner.session();
            if let Some(old) = s.pump.replace(pump) {
                old.abort();
            }
            s.mode = mode;
            s.vitals = DeviceVitals::default();
            inner.reset(&mut s);
        }
        drop(transport);

        inner
            .log
            .info(LogTag::Sys, format!("Switched to {mode} mode"));
        Ok(())
    }

    /// Parses and sends a named command.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] unless CONNECTED; the transport is not touched
    /// - [`Error::UnknownCommand`] or [`Error::InvalidPayload`] for bad input
    /// - any write failure; the connection state is left unchanged
    pub async fn send_command(&self, name: &str, payload: Option<Value>) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            self.inner.log.error(
                LogTag::App,
                format!("Cannot send {name}: Device disconnected"),
            );
            return Err(Error::NotConnected);
        }

        let command = match Command::parse(name, payload.as_ref()) {
            Ok(command) => command,
            Err(e) => {
                match &e {
                    Error::UnknownCommand { .. } => self
                        .inner
                        .log
                        .warn(LogTag::Tx, format!("Unknown command: {name}")),
                    _ => self.inner.log.error(LogTag::App, e.to_string()),
                }
                return Err(e);
            }
        };
        self.send(&command).await
    }

    /// Sends an already-parsed command.
    pub async fn send(&self, command: &Command) -> Result<()> {
        let inner = &*self.inner;
        let name = command.name();
        if inner.state() != ConnectionState::Connected {
            inner.log.error(
                LogTag::App,
                format!("Cannot send {name}: Device disconnected"),
            );
            return Err(Error::NotConnected);
        }

        if !self.mode().is_real() {
            return self.send_simulated(command).await;
        }

        let Some(frames) = command.encode(&inner.codec, SystemTime::now())? else {
            inner.log.warn(
                LogTag::Tx,
                format!("Command {name} not fully implemented on Real Device, updating UI state only."),
            );
            return self.apply_after_delay(command).await;
        };

        inner.write_frames(name, frames).await?;
        inner.apply(command);
        Ok(())
    }

    async fn send_simulated(&self, command: &Command) -> Result<()> {
        let inner = &*self.inner;
        tokio::time::sleep(inner.config.simulated_command_delay).await;
        if inner.state() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }

        inner.log.info(LogTag::Tx, command.mock_line());
        inner.apply(command);
        if matches!(command, Command::Microphone { enable: true }) {
            self.schedule_voice();
        }
        Ok(())
    }

    /// Applies a command that has no wire form, with simulated latency.
    async fn apply_after_delay(&self, command: &Command) -> Result<()> {
        let inner = &*self.inner;
        tokio::time::sleep(inner.config.simulated_command_delay).await;
        if inner.state() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        inner.apply(command);
        Ok(())
    }

    /// Delivers the scripted transcript after the configured delay.
    fn schedule_voice(&self) {
        let weak = Arc::downgrade(&self.inner);
        let delay = self.inner.config.simulated.voice_delay;
        let text = self.inner.config.simulated.voice_transcript.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.state() != ConnectionState::Connected {
                return;
            }
            inner
                .log
                .info(LogTag::Ble, format!("[VOICE] Received: \"{text}\""));
            inner.dispatcher.dispatch(Event::Voice {
                text,
                is_final: true,
            });
        });
        if let Some(old) = self.inner.session().voice.replace(task) {
            old.abort();
        }
    }

    /// Disconnects and stops every background task.
    pub async fn shutdown(&self) -> Result<()> {
        let result = self.disconnect().await;
        let mut s = self.inner.session();
        s.stop_tasks();
        if let Some(pump) = s.pump.take() {
            pump.abort();
        }
        drop(s);
        self.inner.log.info(LogTag::Sys, "Supervisor shut down");
        result
    }
}
