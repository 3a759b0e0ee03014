//! Scripted in-memory connector and transport shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use hublink_communication::{
    select_profile, Connector, DeviceCandidate, DeviceSession, GattCharacteristic, GattService,
    LinkContext, RequestMode, Transport,
};
use hublink_core::{ConnectionError, DeviceState, Error, Result, TransportKind};
use hublink_settings::{BleProfile, BleSettings, ReplSettings};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Observable side of the simulated hub
pub struct MockDevice {
    writes: Mutex<Vec<Vec<u8>>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    links: Mutex<Vec<LinkContext>>,
    requests: Mutex<Vec<RequestMode>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    fail_from: AtomicUsize,
    write_delay: Mutex<Duration>,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            writes: Mutex::new(Vec::new()),
            inbound: Mutex::new(None),
            links: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            fail_from: AtomicUsize::new(usize::MAX),
            write_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RequestMode> {
        self.requests.lock().clone()
    }

    /// Link context handed to the most recent open
    pub fn last_link(&self) -> Option<LinkContext> {
        self.links.lock().last().cloned()
    }

    /// Make every write from now on fail
    pub fn fail_writes(&self) {
        let written = self.writes.lock().len();
        self.fail_from.store(written, Ordering::SeqCst);
    }

    /// Make the write with this index (counting from 0) and all later ones fail
    pub fn fail_from_write(&self, index: usize) {
        self.fail_from.store(index, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    /// Push bytes as if the hub printed them. Returns false once the stream is gone.
    pub fn send_inbound(&self, bytes: &[u8]) -> bool {
        match self.inbound.lock().as_ref() {
            Some(tx) => tx.send(bytes.to_vec()).is_ok(),
            None => false,
        }
    }

    /// Close the inbound stream as if the hub was unplugged
    pub fn end_stream(&self) {
        self.inbound.lock().take();
    }
}

pub struct MockTransport {
    kind: TransportKind,
    info: DeviceCandidate,
    device: Arc<MockDevice>,
    services: Option<Vec<GattService>>,
    profiles: Vec<BleProfile>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    readable: AtomicBool,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn new(info: DeviceCandidate, device: Arc<MockDevice>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        *device.inbound.lock() = Some(tx);
        Self {
            kind: info.kind,
            info,
            device,
            services: None,
            profiles: BleSettings::default().profiles,
            rx: tokio::sync::Mutex::new(rx),
            readable: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_services(mut self, services: Vec<GattService>) -> Self {
        self.services = Some(services);
        self
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn info(&self) -> &DeviceCandidate {
        &self.info
    }

    fn needs_discovery(&self) -> bool {
        self.services.is_some()
    }

    async fn discover_services(&self) -> Result<()> {
        let services = self.services.as_deref().unwrap_or_default();
        select_profile(&self.profiles, services).ok_or(ConnectionError::NoCompatibleService)?;
        Ok(())
    }

    fn is_readable(&self) -> bool {
        self.readable.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    async fn read(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let delay = *self.device.write_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut writes = self.device.writes.lock();
        if writes.len() >= self.device.fail_from.load(Ordering::SeqCst) {
            return Err(Error::communication("simulated write failure"));
        }
        writes.push(data.to_vec());
        Ok(())
    }

    async fn release_reader(&self) {
        self.readable.store(false, Ordering::SeqCst);
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.device.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Scripted connector
pub struct MockConnector {
    kind: TransportKind,
    device: Arc<MockDevice>,
    candidate: DeviceCandidate,
    request_error: Option<ConnectionError>,
    open_error: Option<ConnectionError>,
    services: Option<Vec<GattService>>,
    authorized: Vec<DeviceCandidate>,
    available: bool,
}

impl MockConnector {
    pub fn usb(device: Arc<MockDevice>) -> Self {
        Self::new(
            device,
            DeviceCandidate::new(TransportKind::Usb, "/dev/ttyACM0", "LEGO Technic Large Hub"),
        )
    }

    /// A BLE hub exposing the given GATT services
    pub fn ble(device: Arc<MockDevice>, services: Vec<GattService>) -> Self {
        let mut connector = Self::new(
            device,
            DeviceCandidate::new(TransportKind::Ble, "hci0/dev_A0_E6_F8_1D_2C_11", "SPIKE Hub"),
        );
        connector.services = Some(services);
        connector
    }

    fn new(device: Arc<MockDevice>, candidate: DeviceCandidate) -> Self {
        Self {
            kind: candidate.kind,
            device,
            candidate,
            request_error: None,
            open_error: None,
            services: None,
            authorized: Vec::new(),
            available: true,
        }
    }

    pub fn failing_request(mut self, err: ConnectionError) -> Self {
        self.request_error = Some(err);
        self
    }

    pub fn failing_open(mut self, err: ConnectionError) -> Self {
        self.open_error = Some(err);
        self
    }

    pub fn authorized(mut self) -> Self {
        self.authorized = vec![self.candidate.clone()];
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn into_arc(self) -> Arc<dyn Connector> {
        Arc::new(self)
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn authorized_devices(&self) -> Vec<DeviceCandidate> {
        self.authorized.clone()
    }

    async fn request(&self, mode: RequestMode) -> Result<DeviceCandidate> {
        self.device.requests.lock().push(mode);
        match &self.request_error {
            Some(err) => Err(err.clone().into()),
            None => Ok(self.candidate.clone()),
        }
    }

    async fn open(
        &self,
        candidate: &DeviceCandidate,
        link: LinkContext,
    ) -> Result<Arc<dyn Transport>> {
        if let Some(err) = &self.open_error {
            return Err(err.clone().into());
        }
        self.device.opens.fetch_add(1, Ordering::SeqCst);
        self.device.links.lock().push(link);

        let transport = MockTransport::new(candidate.clone(), Arc::clone(&self.device));
        let transport = match &self.services {
            Some(services) => transport.with_services(services.clone()),
            None => transport,
        };
        Ok(Arc::new(transport))
    }
}

/// REPL settings without the init pause
pub fn fast_repl() -> ReplSettings {
    ReplSettings {
        init_delay_ms: 0,
        ..ReplSettings::default()
    }
}

pub fn session_with(connectors: Vec<Arc<dyn Connector>>) -> DeviceSession {
    DeviceSession::new(fast_repl(), connectors)
}

/// Services of a hub exposing the Nordic UART REPL
pub fn nordic_services() -> Vec<GattService> {
    let profile = BleProfile::nordic_uart();
    vec![GattService {
        uuid: profile.service,
        characteristics: vec![
            GattCharacteristic {
                uuid: profile.write,
                can_write: true,
                can_notify: false,
            },
            GattCharacteristic {
                uuid: profile.notify,
                can_write: false,
                can_notify: true,
            },
        ],
    }]
}

/// Services of a device with nothing REPL-like on it (battery service only)
pub fn unknown_services() -> Vec<GattService> {
    vec![GattService {
        uuid: uuid::Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb),
        characteristics: vec![GattCharacteristic {
            uuid: uuid::Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb),
            can_write: false,
            can_notify: true,
        }],
    }]
}

/// Wait until the watched state satisfies `predicate`
pub async fn wait_for_state<F>(rx: &mut watch::Receiver<DeviceState>, predicate: F) -> DeviceState
where
    F: FnMut(&DeviceState) -> bool,
{
    let state = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(predicate))
        .await
        .expect("timed out waiting for device state")
        .expect("session dropped");
    state.clone()
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
