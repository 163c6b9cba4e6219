//! Direct link over the platform BLE stack.
//!
//! The platform is reached through the [`BlePlatform`] seam: device discovery
//! by name prefix, GATT characteristic resolution, write-without-response and
//! notification subscription. Everything else (frame logging, teardown,
//! event reporting) lives here.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::LogSink;
use crate::protocol::{Frame, hex_line};
use crate::transport::{EventSender, Transport, TransportEvent, TransportMode, notify};
use crate::types::LogTag;

/// Name prefix the glasses advertise with.
pub const DEFAULT_NAME_PREFIX: &str = "G1";

/// Vendor UART service.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Characteristic the host writes frames to.
pub const WRITE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Characteristic the glasses notify on.
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Platform BLE stack.
pub trait BlePlatform: Send + Sync {
    /// Returns true if the host has a usable BLE radio and API.
    fn is_available(&self) -> bool;

    /// Asks for a peripheral whose name starts with `name_prefix`.
    ///
    /// Resolves to `None` when the user dismisses the device picker.
    fn request_device(
        &self,
        name_prefix: &str,
        service: Uuid,
    ) -> BoxFuture<'_, Result<Option<Arc<dyn BleDevice>>>>;
}

/// A discovered peripheral.
pub trait BleDevice: Send + Sync {
    /// Advertised name, if any.
    fn name(&self) -> Option<String>;

    /// Opens the GATT link.
    fn connect(&self) -> BoxFuture<'_, Result<()>>;

    /// Closes the GATT link.
    fn disconnect(&self) -> BoxFuture<'_, Result<()>>;

    /// Resolves a characteristic of `service`.
    fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> BoxFuture<'_, Result<Arc<dyn GattCharacteristic>>>;
}

/// A resolved GATT characteristic.
pub trait GattCharacteristic: Send + Sync {
    /// Writes without waiting for a response.
    fn write_without_response(&self, data: Bytes) -> BoxFuture<'_, Result<()>>;

    /// Starts notifications.
    ///
    /// The platform closes the returned channel when the link drops.
    fn subscribe(&self) -> BoxFuture<'_, Result<mpsc::Receiver<Bytes>>>;
}

/// Configuration for the direct link.
#[derive(Debug, Clone)]
pub struct DirectLinkConfig {
    /// Advertised name prefix to filter on.
    pub name_prefix: String,
    /// Vendor service.
    pub service: Uuid,
    /// Characteristic frames are written to.
    pub write_characteristic: Uuid,
    /// Characteristic inbound data arrives on.
    pub notify_characteristic: Uuid,
}

impl Default for DirectLinkConfig {
    fn default() -> Self {
        Self {
            name_prefix: DEFAULT_NAME_PREFIX.to_owned(),
            service: SERVICE_UUID,
            write_characteristic: WRITE_CHARACTERISTIC_UUID,
            notify_characteristic: NOTIFY_CHARACTERISTIC_UUID,
        }
    }
}

impl DirectLinkConfig {
    /// Sets the advertised name prefix.
    #[must_use]
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Sets the service and characteristic identifiers.
    #[must_use]
    pub const fn gatt(mut self, service: Uuid, write: Uuid, notify: Uuid) -> Self {
        self.service = service;
        self.write_characteristic = write;
        self.notify_characteristic = notify;
        self
    }
}

struct GattSession {
    device: Arc<dyn BleDevice>,
    write: Arc<dyn GattCharacteristic>,
    link_up: Arc<AtomicBool>,
    notify_task: JoinHandle<()>,
}

/// Transport over the platform BLE stack.
pub struct DirectLinkTransport {
    platform: Option<Arc<dyn BlePlatform>>,
    config: DirectLinkConfig,
    log: LogSink,
    session: Option<GattSession>,
    /// Link opened by a connect that has not finished discovery.
    opening: Option<Arc<dyn BleDevice>>,
    events: Option<EventSender>,
}

impl DirectLinkTransport {
    /// Creates a direct link. Without a platform every connect fails.
    #[must_use]
    pub fn new(
        platform: Option<Arc<dyn BlePlatform>>,
        config: DirectLinkConfig,
        log: LogSink,
    ) -> Self {
        Self {
            platform,
            config,
            log,
            session: None,
            opening: None,
            events: None,
        }
    }

    async fn open(&mut self, platform: &dyn BlePlatform) -> Result<GattSession> {
        let prefix = &self.config.name_prefix;
        self.log
            .info(LogTag::Ble, format!("Requesting device ({prefix}_...)..."));

        let Some(device) = platform
            .request_device(prefix, self.config.service)
            .await
            .map_err(|e| discovery(&e))?
        else {
            self.log.info(LogTag::Ble, "Device selection cancelled");
            return Err(Error::Cancelled);
        };

        let name = device.name().unwrap_or_else(|| "unnamed device".to_owned());
        self.log.info(LogTag::Ble, format!("Connecting to {name}..."));
        device.connect().await.map_err(|e| discovery(&e))?;
        self.opening = Some(Arc::clone(&device));

        let resolved = self.resolve(&device).await;
        if resolved.is_err() {
            self.close_opening().await;
        } else {
            self.opening = None;
        }
        resolved
    }

    /// Tears down the current session. Returns false if there was none.
    async fn release_session(&mut self) -> bool {
        let Some(session) = self.session.take() else {
            return false;
        };
        session.notify_task.abort();
        session.link_up.store(false, Ordering::SeqCst);
        if let Err(e) = session.device.disconnect().await {
            tracing::debug!("GATT disconnect failed: {}", e);
        }
        true
    }

    /// Closes a link left behind by a connect abandoned during discovery.
    async fn close_opening(&mut self) {
        let Some(device) = self.opening.take() else {
            return;
        };
        if let Err(e) = device.disconnect().await {
            tracing::debug!("closing half-open link failed: {}", e);
        }
    }

    async fn resolve(&self, device: &Arc<dyn BleDevice>) -> Result<GattSession> {
        self.log.info(LogTag::Ble, "Getting characteristics...");
        let service = self.config.service;
        let write = device
            .characteristic(service, self.config.write_characteristic)
            .await
            .map_err(|e| discovery(&e))?;
        let notify_char = device
            .characteristic(service, self.config.notify_characteristic)
            .await
            .map_err(|e| discovery(&e))?;
        let inbound = notify_char.subscribe().await.map_err(|e| discovery(&e))?;

        let link_up = Arc::new(AtomicBool::new(true));
        let notify_task = spawn_notify_loop(
            inbound,
            Arc::clone(&link_up),
            self.log.clone(),
            self.events.clone(),
        );

        Ok(GattSession {
            device: Arc::clone(device),
            write,
            link_up,
            notify_task,
        })
    }
}

fn discovery(error: &Error) -> Error {
    match error {
        Error::Discovery { message } => Error::Discovery {
            message: message.clone(),
        },
        other => Error::Discovery {
            message: other.to_string(),
        },
    }
}

fn spawn_notify_loop(
    mut inbound: mpsc::Receiver<Bytes>,
    link_up: Arc<AtomicBool>,
    log: LogSink,
    events: Option<EventSender>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(data) = inbound.recv().await {
            log.info(LogTag::Rx, hex_line(&data));
            notify(events.as_ref(), TransportEvent::DataReceived(data));
        }
        link_up.store(false, Ordering::SeqCst);
        log.warn(LogTag::Ble, "Device disconnected");
        notify(events.as_ref(), TransportEvent::Disconnected);
    })
}

impl Transport for DirectLinkTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Direct
    }

    fn connect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.is_connected() {
                return Ok(());
            }
            self.close_opening().await;
            // A session whose link already dropped
            self.release_session().await;

            let platform = match &self.platform {
                Some(platform) if platform.is_available() => Arc::clone(platform),
                _ => {
                    self.log.error(LogTag::Ble, "BLE not supported on this host");
                    return Err(Error::Unavailable {
                        mode: TransportMode::Direct,
                        reason: "no BLE capability".into(),
                    });
                }
            };

            match self.open(platform.as_ref()).await {
                Ok(session) => {
                    self.session = Some(session);
                    self.log.info(LogTag::Ble, "Connected & subscribed");
                    notify(self.events.as_ref(), TransportEvent::Connected);
                    Ok(())
                }
                Err(Error::Cancelled) => Err(Error::Cancelled),
                Err(e) => {
                    self.log.error(LogTag::Ble, format!("Connection failed: {e}"));
                    notify(self.events.as_ref(), TransportEvent::Error(e.to_string()));
                    Err(e)
                }
            }
        })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.opening.is_some() {
                self.close_opening().await;
                self.log.info(LogTag::Ble, "Closed link abandoned during discovery");
            }
            if self.release_session().await {
                self.log.info(LogTag::Ble, "Disconnected, characteristics released");
            }
            Ok(())
        })
    }

    fn write(&mut self, frame: Frame) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let Some(session) = self
                .session
                .as_ref()
                .filter(|s| s.link_up.load(Ordering::SeqCst))
            else {
                self.log.error(LogTag::Ble, "Cannot write: no characteristic");
                return Err(Error::NotConnected);
            };

            let line = frame.to_log_string();
            match session.write.write_without_response(frame.to_bytes()).await {
                Ok(()) => {
                    self.log.info(LogTag::Tx, line);
                    Ok(())
                }
                Err(e) => {
                    self.log.error(LogTag::Ble, format!("Write failed: {e}"));
                    Err(Error::Write {
                        message: e.to_string(),
                    })
                }
            }
        })
    }

    fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.link_up.load(Ordering::SeqCst))
    }

    fn set_event_sender(&mut self, tx: EventSender) {
        self.events = Some(tx);
    }
}

impl Drop for DirectLinkTransport {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.notify_task.abort();
        }
        if let Some(device) = self.opening.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(e) = device.disconnect().await {
                        tracing::debug!("closing half-open link failed: {}", e);
                    }
                });
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::event::EventDispatcher;

    /// In-memory peripheral recording writes and exposing its notify sender.
    #[derive(Default)]
    pub(crate) struct FakeDevice {
        pub writes: Mutex<Vec<Bytes>>,
        pub notify_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
        pub fail_characteristic: bool,
        pub discovery_delay: Duration,
        pub fail_writes: AtomicBool,
        pub connects: Mutex<u32>,
        pub disconnects: Mutex<u32>,
    }

    struct FakeCharacteristic {
        device: Arc<FakeDevice>,
        notify: bool,
    }

    impl GattCharacteristic for FakeCharacteristic {
        fn write_without_response(&self, data: Bytes) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                if self.device.fail_writes.load(Ordering::SeqCst) {
                    return Err(Error::Write {
                        message: "gatt busy".into(),
                    });
                }
                self.device.writes.lock().unwrap().push(data);
                Ok(())
            })
        }

        fn subscribe(&self) -> BoxFuture<'_, Result<mpsc::Receiver<Bytes>>> {
            Box::pin(async move {
                assert!(self.notify);
                let (tx, rx) = mpsc::channel(16);
                *self.device.notify_tx.lock().unwrap() = Some(tx);
                Ok(rx)
            })
        }
    }

    pub(crate) struct FakeHandle(pub Arc<FakeDevice>);

    impl BleDevice for FakeHandle {
        fn name(&self) -> Option<String> {
            Some("G1_L_TEST".into())
        }

        fn connect(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                *self.0.connects.lock().unwrap() += 1;
                Ok(())
            })
        }

        fn disconnect(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                *self.0.disconnects.lock().unwrap() += 1;
                self.0.notify_tx.lock().unwrap().take();
                Ok(())
            })
        }

        fn characteristic(
            &self,
            _service: Uuid,
            characteristic: Uuid,
        ) -> BoxFuture<'_, Result<Arc<dyn GattCharacteristic>>> {
            Box::pin(async move {
                if !self.0.discovery_delay.is_zero() {
                    tokio::time::sleep(self.0.discovery_delay).await;
                }
                if self.0.fail_characteristic {
                    return Err(Error::Discovery {
                        message: "characteristic not found".into(),
                    });
                }
                let c: Arc<dyn GattCharacteristic> = Arc::new(FakeCharacteristic {
                    device: Arc::clone(&self.0),
                    notify: characteristic == NOTIFY_CHARACTERISTIC_UUID,
                });
                Ok(c)
            })
        }
    }

    /// Platform handing out one fake device, or cancelling the picker.
    pub(crate) struct FakePlatform {
        pub available: bool,
        pub cancel: bool,
        pub device: Arc<FakeDevice>,
    }

    impl FakePlatform {
        pub(crate) fn new(device: Arc<FakeDevice>) -> Self {
            Self {
                available: true,
                cancel: false,
                device,
            }
        }
    }

    impl BlePlatform for FakePlatform {
        fn is_available(&self) -> bool {
            self.available
        }

        fn request_device(
            &self,
            name_prefix: &str,
            service: Uuid,
        ) -> BoxFuture<'_, Result<Option<Arc<dyn BleDevice>>>> {
            assert_eq!(name_prefix, DEFAULT_NAME_PREFIX);
            assert_eq!(service, SERVICE_UUID);
            Box::pin(async move {
                if self.cancel {
                    return Ok(None);
                }
                let d: Arc<dyn BleDevice> = Arc::new(FakeHandle(Arc::clone(&self.device)));
                Ok(Some(d))
            })
        }
    }

    fn sink() -> LogSink {
        LogSink::new(EventDispatcher::new(64), 64)
    }

    fn transport(platform: FakePlatform) -> (DirectLinkTransport, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let platform: Arc<dyn BlePlatform> = Arc::new(platform);
        let mut t = DirectLinkTransport::new(Some(platform), DirectLinkConfig::default(), sink());
        t.set_event_sender(tx);
        (t, rx)
    }

    #[tokio::test]
    async fn test_connect_write_and_receive() {
        let device = Arc::new(FakeDevice::default());
        let (mut t, mut events) = transport(FakePlatform::new(Arc::clone(&device)));

        t.connect().await.unwrap();
        assert!(t.is_connected());
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));

        t.write(Frame::from(vec![0x18])).await.unwrap();
        assert_eq!(device.writes.lock().unwrap().as_slice(), &[Bytes::from_static(&[0x18])]);

        let tx = device.notify_tx.lock().unwrap().clone().unwrap();
        tx.send(Bytes::from_static(&[0x25, 0x06])).await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::DataReceived(Bytes::from_static(&[0x25, 0x06])))
        );
    }

    #[tokio::test]
    async fn test_remote_disconnect_reports_event() {
        let device = Arc::new(FakeDevice::default());
        let (mut t, mut events) = transport(FakePlatform::new(Arc::clone(&device)));
        t.connect().await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));

        device.notify_tx.lock().unwrap().take();
        assert_eq!(events.recv().await, Some(TransportEvent::Disconnected));
        assert!(!t.is_connected());
        assert!(matches!(
            t.write(Frame::from(vec![0x18])).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_unavailable_platform() {
        let mut platform = FakePlatform::new(Arc::new(FakeDevice::default()));
        platform.available = false;
        let (mut t, _events) = transport(platform);

        assert!(matches!(
            t.connect().await,
            Err(Error::Unavailable {
                mode: TransportMode::Direct,
                ..
            })
        ));

        let mut none = DirectLinkTransport::new(None, DirectLinkConfig::default(), sink());
        assert!(matches!(none.connect().await, Err(Error::Unavailable { .. })));
    }

    #[tokio::test]
    async fn test_picker_cancelled() {
        let mut platform = FakePlatform::new(Arc::new(FakeDevice::default()));
        platform.cancel = true;
        let (mut t, _events) = transport(platform);
        assert!(matches!(t.connect().await, Err(Error::Cancelled)));
        assert!(!t.is_connected());
    }

    #[tokio::test]
    async fn test_discovery_failure_closes_link() {
        let device = Arc::new(FakeDevice {
            fail_characteristic: true,
            ..FakeDevice::default()
        });
        let (mut t, mut events) = transport(FakePlatform::new(Arc::clone(&device)));

        let err = t.connect().await.unwrap_err();
        assert!(matches!(err, Error::Discovery { .. }));
        assert!(err.is_adapter_error());
        assert_eq!(*device.disconnects.lock().unwrap(), 1);
        assert!(matches!(events.recv().await, Some(TransportEvent::Error(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_discovery_link_is_closed() {
        let device = Arc::new(FakeDevice {
            discovery_delay: Duration::from_secs(10),
            ..FakeDevice::default()
        });
        let (mut t, _events) = transport(FakePlatform::new(Arc::clone(&device)));

        let attempt = tokio::time::timeout(Duration::from_secs(1), t.connect()).await;
        assert!(attempt.is_err());
        assert_eq!(*device.connects.lock().unwrap(), 1);
        assert_eq!(*device.disconnects.lock().unwrap(), 0);

        t.disconnect().await.unwrap();
        assert_eq!(*device.disconnects.lock().unwrap(), 1);
        assert!(!t.is_connected());

        // Dropping mid-discovery closes the link too
        let attempt = tokio::time::timeout(Duration::from_secs(1), t.connect()).await;
        assert!(attempt.is_err());
        drop(t);
        tokio::task::yield_now().await;
        assert_eq!(*device.connects.lock().unwrap(), 2);
        assert_eq!(*device.disconnects.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_write_failure_keeps_link() {
        let device = Arc::new(FakeDevice::default());
        let (mut t, _events) = transport(FakePlatform::new(Arc::clone(&device)));
        t.connect().await.unwrap();

        device.fail_writes.store(true, Ordering::SeqCst);
        assert!(matches!(
            t.write(Frame::from(vec![0x18])).await,
            Err(Error::Write { .. })
        ));
        assert!(t.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_releases_session() {
        let device = Arc::new(FakeDevice::default());
        let (mut t, _events) = transport(FakePlatform::new(Arc::clone(&device)));
        t.connect().await.unwrap();

        t.disconnect().await.unwrap();
        assert!(!t.is_connected());
        assert_eq!(*device.disconnects.lock().unwrap(), 1);

        // Second disconnect is a no-op
        t.disconnect().await.unwrap();
        assert_eq!(*device.disconnects.lock().unwrap(), 1);
    }
}
