//! Host application bridge.
//!
//! The host owns the physical radio and exposes a string-only surface:
//! `connect`, `disconnect` and `write(base64)` outbound, and four callbacks
//! inbound. Binary frames are base64-encoded on the way out and decoded on
//! the way in.
//!
//! A connect request takes the single pending slot, tagged with a request id
//! that the host echoes back in its answer. Ids are unique per endpoint, so
//! an answer meant for an earlier transport on the same endpoint is stale and
//! never resolves the pending request. A link-down callback carries no id and
//! leaves a pending request alone. A request that times out or is dropped
//! releases the slot only if it still owns it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::event::LogSink;
use crate::protocol::{Frame, hex_line};
use crate::transport::{EventSender, Transport, TransportEvent, TransportMode, notify};
use crate::types::LogTag;

/// Default time to wait for the host to answer a connect request.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Correlates a connect request with its answer.
pub type RequestId = u64;

/// Outbound call surface exposed by the host application.
pub trait HostBridge: Send + Sync {
    /// Starts a connect. The host answers through [`BridgeCallbacks`],
    /// echoing `request`.
    fn connect(&self, request: RequestId);

    /// Tears the link down.
    fn disconnect(&self);

    /// Writes one base64-encoded frame.
    fn write(&self, data: &str) -> std::result::Result<(), String>;
}

/// Configuration for the host bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// How long a connect request may stay pending.
    pub connect_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl BridgeConfig {
    /// Sets the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[derive(Debug)]
enum BridgeMessage {
    Connected(RequestId),
    ConnectError(RequestId, String),
    Disconnected,
    Data(String),
}

/// Inbound callbacks the host invokes. Cheap to clone, callable from any thread.
#[derive(Clone)]
pub struct BridgeCallbacks {
    tx: mpsc::UnboundedSender<BridgeMessage>,
}

impl BridgeCallbacks {
    fn send(&self, message: BridgeMessage) {
        if self.tx.send(message).is_err() {
            tracing::debug!("bridge callback after endpoint dropped");
        }
    }

    /// The link requested by `request` is up.
    pub fn on_connected(&self, request: RequestId) {
        self.send(BridgeMessage::Connected(request));
    }

    /// The connect attempt `request` failed.
    pub fn on_connect_error(&self, request: RequestId, reason: impl Into<String>) {
        self.send(BridgeMessage::ConnectError(request, reason.into()));
    }

    /// The link went down.
    pub fn on_disconnected(&self) {
        self.send(BridgeMessage::Disconnected);
    }

    /// Base64-encoded bytes arrived from the glasses.
    pub fn on_data_received(&self, data: impl Into<String>) {
        self.send(BridgeMessage::Data(data.into()));
    }
}

/// Host side of the bridge, reusable across transport instances.
#[derive(Clone)]
pub struct BridgeEndpoint {
    host: Arc<dyn HostBridge>,
    inbound: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<BridgeMessage>>>,
    next_request: Arc<AtomicU64>,
}

impl BridgeEndpoint {
    /// Pairs a host call surface with the callbacks it should invoke.
    #[must_use]
    pub fn channel(host: Arc<dyn HostBridge>) -> (Self, BridgeCallbacks) {
        let (tx, rx) = mpsc::unbounded_channel();
        let endpoint = Self {
            host,
            inbound: Arc::new(tokio::sync::Mutex::new(rx)),
            next_request: Arc::new(AtomicU64::new(1)),
        };
        (endpoint, BridgeCallbacks { tx })
    }

    fn next_request(&self) -> RequestId {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }
}

struct PendingConnect {
    id: RequestId,
    reply: oneshot::Sender<Result<()>>,
}

#[derive(Default)]
struct BridgeState {
    pending: Option<PendingConnect>,
    connected: bool,
    events: Option<EventSender>,
}

struct Shared {
    host: Arc<dyn HostBridge>,
    state: Mutex<BridgeState>,
    log: LogSink,
}

impl Shared {
    fn state(&self) -> std::sync::MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the pending request if it is `id`. Also reports whether any
    /// other request is still waiting.
    fn take_pending(state: &mut BridgeState, id: RequestId) -> (Option<PendingConnect>, bool) {
        match &state.pending {
            Some(p) if p.id == id => (state.pending.take(), false),
            Some(_) => (None, true),
            None => (None, false),
        }
    }

    fn handle(&self, message: BridgeMessage) {
        match message {
            BridgeMessage::Connected(id) => {
                let (pending, in_use, events) = {
                    let mut state = self.state();
                    let (pending, waiting) = Self::take_pending(&mut state, id);
                    let in_use = waiting || state.connected;
                    if pending.is_some() {
                        state.connected = true;
                    }
                    (pending, in_use, state.events.clone())
                };
                let Some(pending) = pending else {
                    self.log.warn(
                        LogTag::Ble,
                        format!("Native: stale connect callback for request {id} ignored"),
                    );
                    // Nobody wants this link unless a newer attempt owns the host
                    if !in_use {
                        self.host.disconnect();
                    }
                    return;
                };
                self.log.info(LogTag::Ble, "Native: Connected to G1");
                notify(events.as_ref(), TransportEvent::Connected);
                if pending.reply.send(Ok(())).is_err() {
                    tracing::debug!("connect request {} gone before reply", pending.id);
                }
            }
            BridgeMessage::ConnectError(id, reason) => {
                let (pending, events) = {
                    let mut state = self.state();
                    (Self::take_pending(&mut state, id).0, state.events.clone())
                };
                let Some(pending) = pending else {
                    self.log.warn(
                        LogTag::Ble,
                        format!("Native: stale connect error for request {id}: {reason}"),
                    );
                    return;
                };
                self.log
                    .error(LogTag::Ble, format!("Native: Connection Error - {reason}"));
                notify(events.as_ref(), TransportEvent::Error(reason.clone()));
                let _ = pending.reply.send(Err(Error::Rejected { reason }));
            }
            BridgeMessage::Disconnected => {
                let (was_connected, events) = {
                    let mut state = self.state();
                    let was_connected = std::mem::replace(&mut state.connected, false);
                    (was_connected, state.events.clone())
                };
                self.log.info(LogTag::Ble, "Native: Disconnected");
                if was_connected {
                    notify(events.as_ref(), TransportEvent::Disconnected);
                }
            }
            BridgeMessage::Data(encoded) => match STANDARD.decode(encoded.as_bytes()) {
                Ok(data) => {
                    self.log.info(LogTag::Rx, hex_line(&data));
                    let events = self.state().events.clone();
                    notify(events.as_ref(), TransportEvent::DataReceived(data.into()));
                }
                Err(e) => {
                    self.log
                        .error(LogTag::Rx, format!("Malformed bridge data: {}", Error::from(e)));
                }
            },
        }
    }
}

/// Releases the pending slot when a connect request ends, if it still owns it.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state();
        if state.pending.as_ref().is_some_and(|p| p.id == self.id) {
            state.pending = None;
        }
    }
}

/// Transport over a host application bridge.
pub struct HostBridgeTransport {
    endpoint: BridgeEndpoint,
    config: BridgeConfig,
    shared: Arc<Shared>,
    pump: Option<JoinHandle<()>>,
}

impl HostBridgeTransport {
    /// Creates a bridge transport over `endpoint`.
    #[must_use]
    pub fn new(endpoint: BridgeEndpoint, config: BridgeConfig, log: LogSink) -> Self {
        let shared = Arc::new(Shared {
            host: Arc::clone(&endpoint.host),
            state: Mutex::new(BridgeState::default()),
            log,
        });
        Self {
            endpoint,
            config,
            shared,
            pump: None,
        }
    }

    fn ensure_pump(&mut self) {
        if self.pump.is_some() {
            return;
        }
        let inbound = Arc::clone(&self.endpoint.inbound);
        let shared = Arc::clone(&self.shared);
        self.pump = Some(tokio::spawn(async move {
            let mut inbound = inbound.lock_owned().await;
            while let Some(message) = inbound.recv().await {
                shared.handle(message);
            }
        }));
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.config.connect_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

impl Transport for HostBridgeTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::HostBridge
    }

    fn connect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.is_connected() {
                return Ok(());
            }
            self.ensure_pump();

            let id = self.endpoint.next_request();
            let (reply, response) = oneshot::channel();
            {
                let mut state = self.shared.state();
                if state.pending.is_some() {
                    return Err(Error::ConnectInProgress);
                }
                state.pending = Some(PendingConnect { id, reply });
            }
            let _guard = PendingGuard {
                shared: self.shared.as_ref(),
                id,
            };

            self.shared
                .log
                .info(LogTag::Ble, "Requesting native connection...");
            self.endpoint.host.connect(id);

            match tokio::time::timeout(self.config.connect_timeout, response).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(Error::ChannelClosed),
                Err(_) => {
                    self.shared
                        .log
                        .error(LogTag::Ble, "Native Connection Timeout");
                    Err(Error::Timeout {
                        timeout_ms: self.timeout_ms(),
                    })
                }
            }
        })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            {
                let mut state = self.shared.state();
                state.pending = None;
                state.connected = false;
            }
            self.endpoint.host.disconnect();
            Ok(())
        })
    }

    fn write(&mut self, frame: Frame) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.is_connected() {
                self.shared
                    .log
                    .error(LogTag::Ble, "Cannot write: Native Disconnected");
                return Err(Error::NotConnected);
            }

            let encoded = STANDARD.encode(frame.as_bytes());
            match self.endpoint.host.write(&encoded) {
                Ok(()) => {
                    self.shared.log.info(LogTag::Tx, frame.to_log_string());
                    Ok(())
                }
                Err(message) => {
                    self.shared
                        .log
                        .error(LogTag::Ble, format!("Write failed: {message}"));
                    Err(Error::Write { message })
                }
            }
        })
    }

    fn is_connected(&self) -> bool {
        self.shared.state().connected
    }

    fn set_event_sender(&mut self, tx: EventSender) {
        self.shared.state().events = Some(tx);
    }
}

impl Drop for HostBridgeTransport {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::event::EventDispatcher;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Reply {
        Accept,
        Reject,
        Silent,
        /// Accepts, then reports the link down straight away.
        Flap,
    }

    /// Host that answers connects according to `reply`.
    pub(crate) struct FakeHost {
        pub reply: Mutex<Reply>,
        pub callbacks: Mutex<Option<BridgeCallbacks>>,
        pub requests: Mutex<Vec<RequestId>>,
        pub writes: Mutex<Vec<String>>,
        pub disconnects: Mutex<u32>,
        pub fail_writes: Mutex<bool>,
    }

    impl FakeHost {
        pub(crate) fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply: Mutex::new(reply),
                callbacks: Mutex::new(None),
                requests: Mutex::new(Vec::new()),
                writes: Mutex::new(Vec::new()),
                disconnects: Mutex::new(0),
                fail_writes: Mutex::new(false),
            })
        }

        pub(crate) fn callbacks(&self) -> BridgeCallbacks {
            self.callbacks.lock().unwrap().clone().unwrap()
        }
    }

    impl HostBridge for FakeHost {
        fn connect(&self, request: RequestId) {
            self.requests.lock().unwrap().push(request);
            let callbacks = self.callbacks();
            match *self.reply.lock().unwrap() {
                Reply::Accept => callbacks.on_connected(request),
                Reply::Reject => callbacks.on_connect_error(request, "GATT 133"),
                Reply::Silent => {}
                Reply::Flap => {
                    callbacks.on_connected(request);
                    callbacks.on_disconnected();
                }
            }
        }

        fn disconnect(&self) {
            *self.disconnects.lock().unwrap() += 1;
        }

        fn write(&self, data: &str) -> std::result::Result<(), String> {
            if *self.fail_writes.lock().unwrap() {
                return Err("bridge busy".into());
            }
            self.writes.lock().unwrap().push(data.to_owned());
            Ok(())
        }
    }

    /// Builds an endpoint whose host is wired to its own callbacks.
    pub(crate) fn endpoint(reply: Reply) -> (BridgeEndpoint, Arc<FakeHost>) {
        let host = FakeHost::new(reply);
        let (endpoint, callbacks) = BridgeEndpoint::channel(Arc::clone(&host) as Arc<dyn HostBridge>);
        *host.callbacks.lock().unwrap() = Some(callbacks);
        (endpoint, host)
    }

    fn transport(
        reply: Reply,
    ) -> (
        HostBridgeTransport,
        Arc<FakeHost>,
        mpsc::Receiver<TransportEvent>,
    ) {
        let (endpoint, host) = endpoint(reply);
        let log = LogSink::new(EventDispatcher::new(64), 64);
        let mut t = HostBridgeTransport::new(endpoint, BridgeConfig::default(), log);
        let (tx, rx) = mpsc::channel(16);
        t.set_event_sender(tx);
        (t, host, rx)
    }

    #[tokio::test]
    async fn test_connect_and_write_base64() {
        let (mut t, host, mut events) = transport(Reply::Accept);

        t.connect().await.unwrap();
        assert!(t.is_connected());
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));

        t.write(Frame::from(vec![0x25, 0x06, 0x00, 0x01, 0x04, 0x01]))
            .await
            .unwrap();
        assert_eq!(host.writes.lock().unwrap().as_slice(), ["JQYAAQQB"]);
    }

    #[tokio::test]
    async fn test_inbound_data_is_decoded() {
        let (mut t, host, mut events) = transport(Reply::Accept);
        t.connect().await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));

        host.callbacks().on_data_received("JQY=");
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::DataReceived(Bytes::from_static(&[0x25, 0x06])))
        );

        // Garbage is logged and dropped
        host.callbacks().on_data_received("!!not base64!!");
        host.callbacks().on_disconnected();
        assert_eq!(events.recv().await, Some(TransportEvent::Disconnected));
        assert!(!t.is_connected());
    }

    #[tokio::test]
    async fn test_connect_error_is_rejected() {
        let (mut t, _host, mut events) = transport(Reply::Reject);

        let err = t.connect().await.unwrap_err();
        assert!(matches!(&err, Error::Rejected { reason } if reason == "GATT 133"));
        assert!(err.is_adapter_error());
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Error("GATT 133".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out_and_frees_slot() {
        let (mut t, host, _events) = transport(Reply::Silent);

        let started = tokio::time::Instant::now();
        let err = t.connect().await.unwrap_err();
        assert!(matches!(err, Error::Timeout { timeout_ms: 15_000 }));
        assert!(started.elapsed() >= DEFAULT_CONNECT_TIMEOUT);

        // A late answer resolves nothing and closes the orphaned link
        host.callbacks().on_connected(1);
        tokio::task::yield_now().await;
        assert!(!t.is_connected());
        assert_eq!(*host.disconnects.lock().unwrap(), 1);

        *host.reply.lock().unwrap() = Reply::Accept;
        t.connect().await.unwrap();
        assert!(t.is_connected());
        assert_eq!(host.requests.lock().unwrap().as_slice(), [1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_request_releases_slot() {
        let (mut t, host, _events) = transport(Reply::Silent);

        let attempt = tokio::time::timeout(Duration::from_secs(1), t.connect()).await;
        assert!(attempt.is_err());
        assert!(t.shared.state().pending.is_none());

        *host.reply.lock().unwrap() = Reply::Accept;
        t.connect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_transport_ignores_earlier_callbacks() {
        let (endpoint, host) = endpoint(Reply::Accept);
        let log = LogSink::new(EventDispatcher::new(64), 64);

        let mut first = HostBridgeTransport::new(endpoint.clone(), BridgeConfig::default(), log.clone());
        first.connect().await.unwrap();
        first.disconnect().await.unwrap();
        drop(first);
        // The host acknowledges the teardown after the transport is gone
        host.callbacks().on_disconnected();

        let mut second = HostBridgeTransport::new(endpoint, BridgeConfig::default(), log);
        second.connect().await.unwrap();
        assert!(second.is_connected());
        second.disconnect().await.unwrap();

        // An answer to the first transport's request resolves nothing
        *host.reply.lock().unwrap() = Reply::Silent;
        let callbacks = host.callbacks();
        let late = async {
            tokio::task::yield_now().await;
            callbacks.on_connected(1);
        };
        let (attempt, ()) = tokio::join!(
            tokio::time::timeout(Duration::from_secs(1), second.connect()),
            late
        );
        assert!(attempt.is_err());
        assert!(!second.is_connected());
        assert_eq!(host.requests.lock().unwrap().as_slice(), [1, 2, 3]);
        assert_eq!(*host.disconnects.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let (mut t, host, _events) = transport(Reply::Accept);
        assert!(matches!(
            t.write(Frame::from(vec![0x18])).await,
            Err(Error::NotConnected)
        ));

        t.connect().await.unwrap();
        *host.fail_writes.lock().unwrap() = true;
        assert!(matches!(
            t.write(Frame::from(vec![0x18])).await,
            Err(Error::Write { .. })
        ));
        assert!(t.is_connected());

        t.disconnect().await.unwrap();
        assert!(!t.is_connected());
        assert_eq!(*host.disconnects.lock().unwrap(), 1);
    }
}
