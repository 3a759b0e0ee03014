//! USB-serial transport
//!
//! Provides port enumeration, hub port selection, and the serial
//! [`Transport`] implementation.
//!
//! Ports are opened at 115200 baud. Inbound bytes are read by a dedicated
//! blocking reader thread with a short timeout and forwarded to the async
//! side over a channel; writes run on the blocking pool so the async runtime
//! never waits on the device.

use super::{Connector, DeviceCandidate, DeviceChooser, LinkContext, RequestMode, Transport};
use async_trait::async_trait;
use hublink_core::{
    thread_safe_none, ConnectionError, Error, Result, ThreadSafeOption, TransportKind,
};
use hublink_settings::{SerialSettings, DEFAULT_BAUD_RATE};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;

/// Size of the reader thread's buffer
const READ_BUFFER_SIZE: usize = 1024;

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyACM0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "USB LEGO System A/S LEGO Technic Large Hub")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,

    /// Product name if available
    pub product: Option<String>,

    /// USB vendor ID if applicable
    pub vid: Option<u16>,

    /// USB product ID if applicable
    pub pid: Option<u16>,
}

impl SerialPortInfo {
    /// Create a new port info
    pub fn new(port_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            description: description.into(),
            manufacturer: None,
            product: None,
            vid: None,
            pid: None,
        }
    }

    /// Set manufacturer
    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    /// Set product name
    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.product = Some(product.into());
        self
    }

    /// Set USB IDs
    pub fn with_usb_ids(mut self, vid: u16, pid: u16) -> Self {
        self.vid = Some(vid);
        self.pid = Some(pid);
        self
    }

    /// Name shown to the user: the USB product name when known
    pub fn display_name(&self) -> String {
        self.product
            .clone()
            .unwrap_or_else(|| self.description.clone())
    }

    /// Convert to a selectable device
    pub fn to_candidate(&self) -> DeviceCandidate {
        DeviceCandidate::new(TransportKind::Usb, &self.port_name, self.display_name())
    }
}

/// List serial ports a hub can appear on
///
/// Filters to USB CDC style names:
/// - Windows: COM* (e.g., COM1, COM3)
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    match serialport::available_ports() {
        Ok(ports) => {
            let port_infos: Vec<SerialPortInfo> = ports
                .iter()
                .filter(|port| is_valid_hub_port(&port.port_name))
                .map(|port| {
                    let info = SerialPortInfo::new(&port.port_name, get_port_description(port));

                    match &port.port_type {
                        serialport::SerialPortType::UsbPort(usb_info) => {
                            let mut info = info.with_usb_ids(usb_info.vid, usb_info.pid);
                            if let Some(ref mfg) = usb_info.manufacturer {
                                info = info.with_manufacturer(mfg);
                            }
                            if let Some(ref product) = usb_info.product {
                                info = info.with_product(product);
                            }
                            info
                        }
                        _ => info,
                    }
                })
                .collect();

            Ok(port_infos)
        }
        Err(e) => {
            tracing::error!("Failed to enumerate serial ports: {}", e);
            Err(Error::other(format!("Failed to enumerate ports: {}", e)))
        }
    }
}

/// Check if a port name looks like a USB serial device
pub fn is_valid_hub_port(port_name: &str) -> bool {
    if let Some(number) = port_name.strip_prefix("COM") {
        return !number.is_empty() && number.chars().all(|c| c.is_ascii_digit());
    }

    port_name.starts_with("/dev/ttyUSB")
        || port_name.starts_with("/dev/ttyACM")
        || port_name.starts_with("/dev/cu.usbserial-")
        || port_name.starts_with("/dev/cu.usbmodem")
}

/// Get a user-friendly description for a port
fn get_port_description(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb_info) => {
            format!(
                "USB {} {}",
                usb_info.manufacturer.as_deref().unwrap_or("Device"),
                usb_info.product.as_deref().unwrap_or("Serial Port")
            )
        }
        serialport::SerialPortType::BluetoothPort => "Bluetooth Serial".to_string(),
        serialport::SerialPortType::PciPort => "PCI Serial".to_string(),
        _ => "Serial Port".to_string(),
    }
}

/// Whether a port may be reopened without prompting
pub fn is_authorized(info: &SerialPortInfo, settings: &SerialSettings) -> bool {
    let by_vendor = info
        .vid
        .map(|vid| settings.authorized_vendor_ids.contains(&vid))
        .unwrap_or(false);
    let remembered = settings.remembered_port.as_deref() == Some(info.port_name.as_str());
    by_vendor || remembered
}

/// Map a `serialport` open failure onto the connection error taxonomy
pub fn classify_open_error(port: &str, err: &serialport::Error) -> ConnectionError {
    match err.kind() {
        serialport::ErrorKind::NoDevice => ConnectionError::PortNotFound {
            port: port.to_string(),
        },
        serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
            ConnectionError::PermissionDenied {
                reason: err.description.clone(),
            }
        }
        serialport::ErrorKind::Io(io::ErrorKind::NotFound) => ConnectionError::PortNotFound {
            port: port.to_string(),
        },
        _ => match ConnectionError::classify_message(port, &err.description) {
            ConnectionError::CommunicationFailure { reason } => ConnectionError::FailedToOpen {
                port: port.to_string(),
                reason,
            },
            classified => classified,
        },
    }
}

/// Selects and opens USB-serial hubs
pub struct SerialConnector {
    settings: SerialSettings,
    chooser: Arc<dyn DeviceChooser>,
}

impl SerialConnector {
    /// Create a connector that prompts through `chooser`
    pub fn new(settings: SerialSettings, chooser: Arc<dyn DeviceChooser>) -> Self {
        Self { settings, chooser }
    }

    /// Ports that may be reopened without prompting
    pub fn authorized_ports(&self) -> Vec<SerialPortInfo> {
        match list_ports() {
            Ok(ports) => ports
                .into_iter()
                .filter(|port| is_authorized(port, &self.settings))
                .collect(),
            Err(e) => {
                tracing::warn!("Could not list authorized ports: {}", e);
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    async fn authorized_devices(&self) -> Vec<DeviceCandidate> {
        self.authorized_ports()
            .iter()
            .map(SerialPortInfo::to_candidate)
            .collect()
    }

    async fn request(&self, mode: RequestMode) -> Result<DeviceCandidate> {
        match mode {
            RequestMode::Interactive => {
                let candidates: Vec<DeviceCandidate> =
                    list_ports()?.iter().map(SerialPortInfo::to_candidate).collect();

                if candidates.is_empty() {
                    return Err(ConnectionError::PortNotFound {
                        port: "no USB serial ports available".to_string(),
                    }
                    .into());
                }

                self.chooser
                    .choose(TransportKind::Usb, candidates)
                    .await
                    .ok_or_else(|| ConnectionError::UserCancelled.into())
            }
            RequestMode::Resume(port) => self
                .authorized_ports()
                .into_iter()
                .find(|info| info.port_name == port)
                .map(|info| info.to_candidate())
                .ok_or_else(|| {
                    ConnectionError::PermissionDenied {
                        reason: format!("{} has not been authorized", port),
                    }
                    .into()
                }),
        }
    }

    async fn open(
        &self,
        candidate: &DeviceCandidate,
        _link: LinkContext,
    ) -> Result<Arc<dyn Transport>> {
        let port_name = candidate.id.clone();
        let baud_rate = DEFAULT_BAUD_RATE;
        if self.settings.baud_rate != baud_rate {
            tracing::warn!(
                "Ignoring configured {} baud, the hub REPL runs at {}",
                self.settings.baud_rate,
                baud_rate
            );
        }
        let timeout = Duration::from_millis(self.settings.read_timeout_ms);

        let opened = tokio::task::spawn_blocking(move || {
            let port = serialport::new(&port_name, baud_rate)
                .timeout(timeout)
                .open()
                .map_err(|e| {
                    tracing::warn!("Failed to open serial port {}: {}", port_name, e);
                    classify_open_error(&port_name, &e)
                })?;
            let reader = port.try_clone().map_err(|e| ConnectionError::FailedToOpen {
                port: port_name.clone(),
                reason: e.description,
            })?;
            Ok::<_, ConnectionError>((port, reader))
        })
        .await
        .map_err(|e| Error::other(format!("Serial open task failed: {}", e)))?;

        let (port, reader) = opened?;
        tracing::info!("Opened {} at {} baud", candidate.id, baud_rate);

        Ok(Arc::new(SerialTransport::start(candidate.clone(), port, reader)))
    }
}

/// An open USB-serial channel
pub struct SerialTransport {
    info: DeviceCandidate,
    port: ThreadSafeOption<Box<dyn serialport::SerialPort>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    reading: Arc<AtomicBool>,
    reader_thread: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SerialTransport {
    /// Wrap an opened port, starting the reader thread on `reader`
    pub fn start(
        info: DeviceCandidate,
        port: Box<dyn serialport::SerialPort>,
        reader: Box<dyn serialport::SerialPort>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let reading = Arc::new(AtomicBool::new(true));
        let thread = spawn_reader(info.id.clone(), reader, Arc::clone(&reading), tx);

        let shared = thread_safe_none();
        *shared.lock() = Some(port);

        Self {
            info,
            port: shared,
            inbound: tokio::sync::Mutex::new(rx),
            reading,
            reader_thread: Mutex::new(thread),
            closed: AtomicBool::new(false),
        }
    }
}

fn spawn_reader(
    port_name: String,
    mut reader: Box<dyn serialport::SerialPort>,
    reading: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
) -> Option<JoinHandle<()>> {
    let flag = Arc::clone(&reading);
    let spawned = std::thread::Builder::new()
        .name(format!("serial-reader {}", port_name))
        .spawn(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            while flag.load(Ordering::Acquire) {
                match reader.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::warn!("Serial read on {} failed: {}", port_name, e);
                        break;
                    }
                }
            }
            flag.store(false, Ordering::Release);
            tracing::debug!("Serial reader for {} stopped", port_name);
        });

    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::error!("Could not start serial reader: {}", e);
            reading.store(false, Ordering::Release);
            None
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    fn info(&self) -> &DeviceCandidate {
        &self.info
    }

    fn is_readable(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    async fn read(&self) -> Result<Option<Vec<u8>>> {
        let mut inbound = self.inbound.lock().await;
        Ok(inbound.recv().await)
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let port = Arc::clone(&self.port);
        let data = data.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut guard = port.lock();
            let port = guard.as_mut().ok_or(ConnectionError::NotConnected)?;
            port.write_all(&data)?;
            port.flush()?;
            Ok::<_, Error>(())
        })
        .await
        .map_err(|e| Error::other(format!("Serial write task failed: {}", e)))?
        .map_err(|e| match e {
            Error::Io(io) => Error::communication(format!("Serial write failed: {}", io)),
            other => other,
        })
    }

    async fn release_reader(&self) {
        self.reading.store(false, Ordering::Release);
        let handle = self.reader_thread.lock().take();
        if let Some(handle) = handle {
            let joined = tokio::task::spawn_blocking(move || handle.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                tracing::warn!("Serial reader for {} did not stop cleanly", self.info.id);
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.release_reader().await;
        if self.port.lock().take().is_some() {
            tracing::info!("Closed {}", self.info.id);
        }
    }
}
