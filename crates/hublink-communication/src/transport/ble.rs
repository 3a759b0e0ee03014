//! Bluetooth LE GATT transport
//!
//! The hub exposes its REPL through one of several GATT profiles. After
//! connecting, the device's services are matched against the configured
//! [`BleProfile`] list in order and the first complete match is used:
//! commands go to its write characteristic in paced 20-byte chunks and
//! output arrives as notifications on its notify characteristic.

use super::chunking::{write_chunked, ChunkSink, CHUNK_DELAY, CHUNK_SIZE};
use super::{Connector, DeviceCandidate, DeviceChooser, LinkContext, RequestMode, Transport};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, Service, ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use hublink_core::{ConnectionError, Error, Result, TransportKind};
use hublink_settings::{BleProfile, BleSettings};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A characteristic as seen during profile matching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub can_write: bool,
    pub can_notify: bool,
}

/// A service as seen during profile matching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    fn has(&self, uuid: Uuid, check: impl Fn(&GattCharacteristic) -> bool) -> bool {
        self.characteristics
            .iter()
            .any(|c| c.uuid == uuid && check(c))
    }
}

/// Pick the first profile, in priority order, the device fully supports.
///
/// A profile matches when its service is present and that service carries a
/// writable write characteristic and a notifying notify characteristic.
pub fn select_profile<'a>(
    profiles: &'a [BleProfile],
    services: &[GattService],
) -> Option<(usize, &'a BleProfile)> {
    profiles.iter().enumerate().find(|(_, profile)| {
        services.iter().any(|service| {
            service.uuid == profile.service
                && service.has(profile.write, |c| c.can_write)
                && service.has(profile.notify, |c| c.can_notify)
        })
    })
}

fn gatt_services(services: &BTreeSet<Service>) -> Vec<GattService> {
    services
        .iter()
        .map(|service| GattService {
            uuid: service.uuid,
            characteristics: service
                .characteristics
                .iter()
                .map(|c| GattCharacteristic {
                    uuid: c.uuid,
                    can_write: c
                        .properties
                        .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE),
                    can_notify: c
                        .properties
                        .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
                })
                .collect(),
        })
        .collect()
}

fn find_characteristic(
    services: &BTreeSet<Service>,
    service: Uuid,
    characteristic: Uuid,
) -> Option<Characteristic> {
    services
        .iter()
        .filter(|s| s.uuid == service)
        .flat_map(|s| s.characteristics.iter())
        .find(|c| c.uuid == characteristic)
        .cloned()
}

/// Map a btleplug failure onto the connection error taxonomy
fn classify_ble_error(device: &str, err: &btleplug::Error) -> ConnectionError {
    match err {
        btleplug::Error::PermissionDenied => ConnectionError::PermissionDenied {
            reason: err.to_string(),
        },
        btleplug::Error::DeviceNotFound => ConnectionError::PortNotFound {
            port: device.to_string(),
        },
        other => ConnectionError::classify_message(device, &other.to_string()),
    }
}

/// Selects and opens Bluetooth LE hubs
pub struct BleConnector {
    settings: BleSettings,
    chooser: Arc<dyn DeviceChooser>,
    adapter: OnceCell<Option<Adapter>>,
    discovered: Mutex<HashMap<String, Peripheral>>,
}

impl BleConnector {
    /// Create a connector that prompts through `chooser`
    pub fn new(settings: BleSettings, chooser: Arc<dyn DeviceChooser>) -> Self {
        Self {
            settings,
            chooser,
            adapter: OnceCell::new(),
            discovered: Mutex::new(HashMap::new()),
        }
    }

    async fn adapter(&self) -> Option<&Adapter> {
        self.adapter
            .get_or_init(|| async {
                let manager = match Manager::new().await {
                    Ok(manager) => manager,
                    Err(e) => {
                        tracing::warn!("Bluetooth manager unavailable: {}", e);
                        return None;
                    }
                };
                match manager.adapters().await {
                    Ok(adapters) => {
                        let adapter = adapters.into_iter().next();
                        if adapter.is_none() {
                            tracing::warn!("No Bluetooth adapter found");
                        }
                        adapter
                    }
                    Err(e) => {
                        tracing::warn!("Could not list Bluetooth adapters: {}", e);
                        None
                    }
                }
            })
            .await
            .as_ref()
    }

    fn unsupported() -> Error {
        ConnectionError::Unsupported {
            transport: "Bluetooth LE".to_string(),
        }
        .into()
    }

    async fn scan(&self, adapter: &Adapter) -> Result<Vec<DeviceCandidate>> {
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| classify_ble_error("adapter", &e))?;
        tokio::time::sleep(Duration::from_millis(self.settings.scan_timeout_ms)).await;
        if let Err(e) = adapter.stop_scan().await {
            tracing::debug!("stop_scan failed: {}", e);
        }

        let peripherals = adapter
            .peripherals()
            .await
            .map_err(|e| classify_ble_error("adapter", &e))?;

        let mut candidates = Vec::new();
        let mut discovered = HashMap::new();
        for peripheral in peripherals {
            let name = match peripheral.properties().await {
                Ok(Some(props)) => props.local_name,
                _ => None,
            };
            let name = match (name, self.settings.name_prefix.as_deref()) {
                (Some(name), Some(prefix)) if !name.starts_with(prefix) => continue,
                (None, Some(_)) => continue,
                (Some(name), _) => name,
                (None, None) => "Unknown device".to_string(),
            };
            let id = format!("{:?}", peripheral.id());
            candidates.push(DeviceCandidate::new(TransportKind::Ble, &id, name));
            discovered.insert(id, peripheral);
        }

        tracing::debug!("Scan found {} Bluetooth device(s)", candidates.len());
        *self.discovered.lock() = discovered;
        Ok(candidates)
    }
}

#[async_trait]
impl Connector for BleConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    async fn is_available(&self) -> bool {
        self.adapter().await.is_some()
    }

    async fn request(&self, mode: RequestMode) -> Result<DeviceCandidate> {
        if let RequestMode::Resume(id) = mode {
            return Err(ConnectionError::PermissionDenied {
                reason: format!("Bluetooth device {} must be chosen interactively", id),
            }
            .into());
        }

        let adapter = self.adapter().await.ok_or_else(Self::unsupported)?;
        let candidates = self.scan(adapter).await?;
        if candidates.is_empty() {
            return Err(ConnectionError::PortNotFound {
                port: "no Bluetooth devices found".to_string(),
            }
            .into());
        }

        self.chooser
            .choose(TransportKind::Ble, candidates)
            .await
            .ok_or_else(|| ConnectionError::UserCancelled.into())
    }

    async fn open(
        &self,
        candidate: &DeviceCandidate,
        link: LinkContext,
    ) -> Result<Arc<dyn Transport>> {
        let adapter = self.adapter().await.ok_or_else(Self::unsupported)?;
        let peripheral = self
            .discovered
            .lock()
            .get(&candidate.id)
            .cloned()
            .ok_or_else(|| ConnectionError::PortNotFound {
                port: candidate.id.clone(),
            })?;

        peripheral
            .connect()
            .await
            .map_err(|e| classify_ble_error(&candidate.name, &e))?;
        tracing::info!("Connected to {} over Bluetooth", candidate.name);

        let watcher = match adapter.events().await {
            Ok(mut events) => {
                let watched = peripheral.id();
                Some(tokio::spawn(async move {
                    while let Some(event) = events.next().await {
                        if let CentralEvent::DeviceDisconnected(id) = event {
                            if id == watched {
                                link.report_lost();
                                break;
                            }
                        }
                    }
                }))
            }
            Err(e) => {
                tracing::warn!("Cannot watch for Bluetooth disconnects: {}", e);
                None
            }
        };

        Ok(Arc::new(BleTransport::new(
            candidate.clone(),
            peripheral,
            self.settings.profiles.clone(),
            watcher,
        )))
    }
}

#[derive(Clone)]
struct Endpoints {
    write: Characteristic,
    notify: Characteristic,
    write_type: WriteType,
}

struct GattSink<'a> {
    peripheral: &'a Peripheral,
    characteristic: &'a Characteristic,
    write_type: WriteType,
}

#[async_trait]
impl<'a> ChunkSink for GattSink<'a> {
    async fn write_chunk(&self, chunk: &[u8]) -> Result<()> {
        self.peripheral
            .write(self.characteristic, chunk, self.write_type)
            .await
            .map_err(|e| Error::communication(format!("GATT write failed: {}", e)))
    }
}

/// An open Bluetooth LE channel
pub struct BleTransport {
    info: DeviceCandidate,
    peripheral: Peripheral,
    profiles: Vec<BleProfile>,
    endpoints: Mutex<Option<Endpoints>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    notifications: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    reading: AtomicBool,
    closed: AtomicBool,
}

impl BleTransport {
    fn new(
        info: DeviceCandidate,
        peripheral: Peripheral,
        profiles: Vec<BleProfile>,
        watcher: Option<JoinHandle<()>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            info,
            peripheral,
            profiles,
            endpoints: Mutex::new(None),
            inbound: tokio::sync::Mutex::new(rx),
            inbound_tx: Mutex::new(Some(tx)),
            notifications: Mutex::new(None),
            watcher: Mutex::new(watcher),
            reading: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    fn endpoints(&self) -> Option<Endpoints> {
        self.endpoints.lock().clone()
    }
}

#[async_trait]
impl Transport for BleTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    fn info(&self) -> &DeviceCandidate {
        &self.info
    }

    fn needs_discovery(&self) -> bool {
        true
    }

    async fn discover_services(&self) -> Result<()> {
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| classify_ble_error(&self.info.name, &e))?;

        let services = self.peripheral.services();
        let (index, profile) = select_profile(&self.profiles, &gatt_services(&services))
            .ok_or(ConnectionError::NoCompatibleService)?;

        let write = find_characteristic(&services, profile.service, profile.write)
            .ok_or(ConnectionError::NoCompatibleService)?;
        let notify = find_characteristic(&services, profile.service, profile.notify)
            .ok_or(ConnectionError::NoCompatibleService)?;
        let write_type = if write
            .properties
            .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
        {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };
        tracing::info!(
            "{} matched profile #{} ({})",
            self.info.name,
            index,
            profile.name
        );

        self.peripheral
            .subscribe(&notify)
            .await
            .map_err(|e| classify_ble_error(&self.info.name, &e))?;
        let mut stream = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| classify_ble_error(&self.info.name, &e))?;

        let tx = self
            .inbound_tx
            .lock()
            .take()
            .ok_or(ConnectionError::NotConnected)?;
        let notify_uuid = notify.uuid;
        let name = self.info.name.clone();
        let task = tokio::spawn(async move {
            while let Some(ValueNotification { uuid, value }) = stream.next().await {
                if uuid == notify_uuid && tx.send(value).is_err() {
                    break;
                }
            }
            tracing::debug!("Notifications from {} ended", name);
        });

        *self.notifications.lock() = Some(task);
        *self.endpoints.lock() = Some(Endpoints {
            write,
            notify,
            write_type,
        });
        Ok(())
    }

    fn is_readable(&self) -> bool {
        self.reading.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    async fn read(&self) -> Result<Option<Vec<u8>>> {
        let mut inbound = self.inbound.lock().await;
        Ok(inbound.recv().await)
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let endpoints = self.endpoints().ok_or(ConnectionError::NotConnected)?;
        let sink = GattSink {
            peripheral: &self.peripheral,
            characteristic: &endpoints.write,
            write_type: endpoints.write_type,
        };
        write_chunked(&sink, data, CHUNK_SIZE, CHUNK_DELAY).await?;
        Ok(())
    }

    async fn release_reader(&self) {
        if !self.reading.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(endpoints) = self.endpoints() {
            if let Err(e) = self.peripheral.unsubscribe(&endpoints.notify).await {
                tracing::debug!("Unsubscribe from {} failed: {}", self.info.name, e);
            }
        }
        let task = self.notifications.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        self.inbound_tx.lock().take();
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        self.release_reader().await;
        if let Err(e) = self.peripheral.disconnect().await {
            tracing::warn!("Disconnect from {} failed: {}", self.info.name, e);
        } else {
            tracing::info!("Disconnected from {}", self.info.name);
        }
    }
}
