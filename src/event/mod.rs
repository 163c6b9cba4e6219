//! Event system for the supervisor's subscription feeds.
//!
//! Connection-state changes, vitals snapshots, log lines, raw inbound data,
//! voice transcripts and music playback are all broadcast as [`Event`]s. Subscribers that fall
//! behind skip the events they missed rather than blocking the supervisor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::commands::MusicState;
use crate::types::{ConnectionState, DeviceVitals, LogBuffer, LogEntry, LogLevel, LogTag};

/// Event types that can be dispatched.
#[derive(Debug, Clone)]
pub enum Event {
    /// Connection state changed.
    StateChanged(ConnectionState),
    /// New vitals snapshot, or `None` while not connected.
    Vitals(Option<Box<DeviceVitals>>),
    /// A log line was emitted.
    Log(LogEntry),
    /// Raw bytes received from the glasses.
    DataReceived(Bytes),
    /// Voice transcript from the glasses microphone.
    Voice { text: String, is_final: bool },
    /// Music playback state changed.
    Music(MusicState),
}

/// Discriminant of an [`Event`], used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`Event::StateChanged`].
    State,
    /// [`Event::Vitals`].
    Vitals,
    /// [`Event::Log`].
    Log,
    /// [`Event::DataReceived`].
    Data,
    /// [`Event::Voice`].
    Voice,
    /// [`Event::Music`].
    Music,
}

impl Event {
    /// Returns the kind of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::StateChanged(_) => EventKind::State,
            Self::Vitals(_) => EventKind::Vitals,
            Self::Log(_) => EventKind::Log,
            Self::DataReceived(_) => EventKind::Data,
            Self::Voice { .. } => EventKind::Voice,
            Self::Music(_) => EventKind::Music,
        }
    }
}

/// Subscription filter for specific event types.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by event kinds.
    pub kinds: Option<Vec<EventKind>>,
    /// Filter for a specific connection state.
    pub state: Option<ConnectionState>,
}

impl EventFilter {
    /// Creates a filter for specific event kinds.
    #[must_use]
    pub const fn kinds(kinds: Vec<EventKind>) -> Self {
        Self {
            kinds: Some(kinds),
            state: None,
        }
    }

    /// Creates a filter matching a transition into `state`.
    #[must_use]
    pub fn state(state: ConnectionState) -> Self {
        Self {
            kinds: Some(vec![EventKind::State]),
            state: Some(state),
        }
    }

    /// Checks if an event matches this filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if self
            .kinds
            .as_ref()
            .is_some_and(|kinds| !kinds.contains(&event.kind()))
        {
            return false;
        }

        if let Some(expected) = self.state {
            return matches!(event, Event::StateChanged(state) if *state == expected);
        }

        true
    }
}

/// A subscription to events.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
    filter: Option<EventFilter>,
}

impl Subscription {
    /// Receives the next matching event, or `None` once the dispatcher is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.filter.as_ref().is_none_or(|f| f.matches(&event)) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next already-queued matching event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.filter.as_ref().is_none_or(|f| f.matches(&event)) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return None,
            }
        }
    }
}

/// Dispatches events to subscribers.
#[derive(Clone)]
pub struct EventDispatcher {
    sender: broadcast::Sender<Event>,
}

impl EventDispatcher {
    /// Creates a new event dispatcher.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Dispatches an event to all subscribers.
    pub fn dispatch(&self, event: Event) {
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribes to events with an optional filter.
    #[must_use]
    pub fn subscribe(&self, filter: Option<EventFilter>) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            filter,
        }
    }

    /// Waits for an event matching the filter with timeout.
    ///
    /// Returns `None` if the timeout expires or the channel is closed.
    pub async fn wait_for(
        &self,
        filter: EventFilter,
        timeout: std::time::Duration,
    ) -> Option<Event> {
        let mut subscription = self.subscribe(Some(filter));
        tokio::time::timeout(timeout, subscription.recv())
            .await
            .ok()
            .flatten()
    }
}

/// Writes [`LogEntry`]s to the ring buffer, the event stream and `tracing`.
#[derive(Clone)]
pub struct LogSink {
    dispatcher: EventDispatcher,
    buffer: Arc<Mutex<LogBuffer>>,
    next_id: Arc<AtomicU64>,
}

impl LogSink {
    /// Creates a sink that keeps at most `capacity` entries.
    #[must_use]
    pub fn new(dispatcher: EventDispatcher, capacity: usize) -> Self {
        Self {
            dispatcher,
            buffer: Arc::new(Mutex::new(LogBuffer::new(capacity))),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Emits one log entry.
    pub fn emit(&self, tag: LogTag, level: LogLevel, message: impl Into<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = LogEntry::now(id, tag, level, message);

        match level {
            LogLevel::Debug => tracing::debug!(tag = %tag, "{}", entry.message),
            LogLevel::Info => tracing::info!(tag = %tag, "{}", entry.message),
            LogLevel::Warn => tracing::warn!(tag = %tag, "{}", entry.message),
            LogLevel::Error => tracing::error!(tag = %tag, "{}", entry.message),
        }

        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        self.dispatcher.dispatch(Event::Log(entry));
    }

    /// Emits an INFO entry.
    pub fn info(&self, tag: LogTag, message: impl Into<String>) {
        self.emit(tag, LogLevel::Info, message);
    }

    /// Emits a WARN entry.
    pub fn warn(&self, tag: LogTag, message: impl Into<String>) {
        self.emit(tag, LogLevel::Warn, message);
    }

    /// Emits an ERROR entry.
    pub fn error(&self, tag: LogTag, message: impl Into<String>) {
        self.emit(tag, LogLevel::Error, message);
    }

    /// Emits a DEBUG entry.
    pub fn debug(&self, tag: LogTag, message: impl Into<String>) {
        self.emit(tag, LogLevel::Debug, message);
    }

    /// Returns the buffered entries, oldest first.
    #[must_use]
    pub fn recent(&self) -> Vec<LogEntry> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }
}
