//! Transport capability
//!
//! A transport is the physical channel to the hub. Two variants exist:
//! - [`serial`]: USB-serial, a continuous byte stream
//! - [`ble`]: Bluetooth LE GATT, small writes and pushed notifications
//!
//! Each variant provides a [`Connector`] that selects and opens a device and
//! a [`Transport`] for the opened channel. The connection state machine only
//! ever talks to these two traits.

pub mod ble;
pub mod chunking;
pub mod serial;

use async_trait::async_trait;
use hublink_core::{HandleId, Result, TransportKind};
use std::sync::Arc;
use tokio::sync::mpsc;

pub use chunking::{write_chunked, ChunkSink};

/// A device offered for selection, or the one selected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCandidate {
    /// Transport the device is reachable over
    pub kind: TransportKind,
    /// Stable id (port path or BLE peripheral id)
    pub id: String,
    /// Display name
    pub name: String,
}

impl DeviceCandidate {
    /// Create a new candidate
    pub fn new(kind: TransportKind, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            name: name.into(),
        }
    }
}

/// How a device is requested from a connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestMode {
    /// Ask the user to pick a device. Only valid in response to a user action.
    Interactive,
    /// Reopen an already authorized device without prompting
    Resume(String),
}

/// Picks one device out of the discovered candidates.
///
/// Returning `None` means the user dismissed the chooser.
#[async_trait]
pub trait DeviceChooser: Send + Sync {
    /// Let the user choose among `candidates`
    async fn choose(
        &self,
        kind: TransportKind,
        candidates: Vec<DeviceCandidate>,
    ) -> Option<DeviceCandidate>;
}

/// Chooser that takes the first candidate, for unattended use
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstDeviceChooser;

#[async_trait]
impl DeviceChooser for FirstDeviceChooser {
    async fn choose(
        &self,
        _kind: TransportKind,
        candidates: Vec<DeviceCandidate>,
    ) -> Option<DeviceCandidate> {
        candidates.into_iter().next()
    }
}

/// Back channel from an opened link to the session that owns it.
///
/// Transports and the read loop use it to report that the device ended the
/// link; the report carries the link's [`HandleId`] so the session can ignore
/// reports from a link it already replaced.
#[derive(Debug, Clone)]
pub struct LinkContext {
    handle_id: HandleId,
    lost_tx: mpsc::UnboundedSender<HandleId>,
}

impl LinkContext {
    /// Create a context for a new link
    pub fn new(handle_id: HandleId, lost_tx: mpsc::UnboundedSender<HandleId>) -> Self {
        Self { handle_id, lost_tx }
    }

    /// Id of the link this context belongs to
    pub fn handle_id(&self) -> HandleId {
        self.handle_id
    }

    /// Report that the device ended the link
    pub fn report_lost(&self) {
        if self.lost_tx.send(self.handle_id).is_err() {
            tracing::trace!("{} lost after its session stopped listening", self.handle_id);
        }
    }
}

/// Selects and opens devices of one transport kind
#[async_trait]
pub trait Connector: Send + Sync {
    /// Transport kind this connector provides
    fn kind(&self) -> TransportKind;

    /// Whether the host has this transport at all
    async fn is_available(&self) -> bool {
        true
    }

    /// Devices that may be reopened without prompting
    async fn authorized_devices(&self) -> Vec<DeviceCandidate> {
        Vec::new()
    }

    /// Select a device. `Interactive` may prompt the user.
    async fn request(&self, mode: RequestMode) -> Result<DeviceCandidate>;

    /// Open the physical channel to a selected device
    async fn open(
        &self,
        candidate: &DeviceCandidate,
        link: LinkContext,
    ) -> Result<Arc<dyn Transport>>;
}

/// An opened channel to the hub
///
/// All methods take `&self`; the read loop and the write drain task use the
/// transport concurrently, one reader and one writer at a time.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport kind
    fn kind(&self) -> TransportKind;

    /// The device this channel is open to
    fn info(&self) -> &DeviceCandidate;

    /// Whether [`Transport::discover_services`] must run before use
    fn needs_discovery(&self) -> bool {
        false
    }

    /// Locate the REPL characteristics
    async fn discover_services(&self) -> Result<()> {
        Ok(())
    }

    /// Whether reads can still produce data
    fn is_readable(&self) -> bool;

    /// Wait for the next inbound chunk. `None` means end of stream.
    async fn read(&self) -> Result<Option<Vec<u8>>>;

    /// Write a complete payload, applying the transport's own pacing
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Stop producing inbound data. Idempotent.
    async fn release_reader(&self);

    /// Close the channel. Idempotent and best-effort: failures are logged.
    async fn close(&self);
}
