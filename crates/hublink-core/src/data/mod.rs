//! Device data model
//!
//! Provides the authoritative [`DeviceState`] record for the single logical
//! hub, together with its [`DeviceStatus`] lifecycle, the attached
//! [`TransportKind`], and the [`HandleId`] that identifies an opened channel.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle status of the logical device
///
/// USB connections move through
/// `Idle → Requesting → ConnectingTransport → InitializingRepl → Connected`.
/// BLE connections add `DiscoveringServices` after `ConnectingTransport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Nothing attached, nothing attempted (or last attempt was cancelled)
    #[default]
    Idle,
    /// Waiting for the user to pick a device
    Requesting,
    /// Opening the physical channel
    ConnectingTransport,
    /// Matching GATT services against the known profiles
    DiscoveringServices,
    /// Interrupting the interpreter and sending the import preamble
    InitializingRepl,
    /// Ready for commands
    Connected,
    /// Torn down after a session
    Disconnected,
    /// Last attempt failed
    Error,
    /// Host lacks the requested transport
    Unsupported,
}

impl DeviceStatus {
    /// Statuses in which a transport is attached.
    pub fn has_transport(&self) -> bool {
        matches!(
            self,
            Self::ConnectingTransport
                | Self::DiscoveringServices
                | Self::InitializingRepl
                | Self::Connected
        )
    }

    /// Statuses from which `connect` may start.
    pub fn can_connect(&self) -> bool {
        matches!(
            self,
            Self::Idle | Self::Disconnected | Self::Error | Self::Unsupported
        )
    }

    /// Statuses that belong to an in-flight connect sequence.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            Self::Requesting
                | Self::ConnectingTransport
                | Self::DiscoveringServices
                | Self::InitializingRepl
        )
    }

    /// Check if a transition from this status to `target` is valid.
    ///
    /// Every status may fall back to `Error`, `Idle` (cancellation) or
    /// `Disconnected` (teardown); forward moves follow the connect sequence.
    pub fn can_transition_to(&self, target: DeviceStatus) -> bool {
        use DeviceStatus::*;
        if *self == target {
            return true;
        }
        if matches!(target, Error | Idle | Disconnected) {
            return true;
        }
        matches!(
            (self, target),
            (Idle | Disconnected | Error | Unsupported, Requesting | Unsupported)
                | (Requesting, ConnectingTransport)
                | (ConnectingTransport, DiscoveringServices | InitializingRepl)
                | (DiscoveringServices, InitializingRepl)
                | (InitializingRepl, Connected)
        )
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Requesting => write!(f, "requesting"),
            Self::ConnectingTransport => write!(f, "connecting_transport"),
            Self::DiscoveringServices => write!(f, "discovering_services"),
            Self::InitializingRepl => write!(f, "initializing_repl"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Error => write!(f, "error"),
            Self::Unsupported => write!(f, "unsupported"),
        }
    }
}

/// Physical transport attached to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// No transport attached
    #[default]
    None,
    /// USB-serial
    Usb,
    /// Bluetooth Low Energy GATT
    Ble,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Usb => write!(f, "usb"),
            Self::Ble => write!(f, "ble"),
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "usb" | "serial" => Ok(Self::Usb),
            "ble" | "bluetooth" => Ok(Self::Ble),
            other => Err(format!("unknown transport '{}'", other)),
        }
    }
}

/// Identity of one opened transport channel.
///
/// Every successful open gets a fresh id so events raised by a replaced
/// channel can be told apart from events of the live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(Uuid);

impl HandleId {
    /// Create a new unique handle id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Link({})", &self.0.to_string()[..8])
    }
}

/// Snapshot of the logical device
///
/// Exactly one instance is live per session; it is owned by the connection
/// state machine and handed out read-only.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceState {
    /// Lifecycle status
    pub status: DeviceStatus,
    /// Attached transport
    pub transport_kind: TransportKind,
    /// Display name, set once a transport is attached
    pub name: Option<String>,
    /// Device id (port path or BLE address), set once a transport is attached
    pub id: Option<String>,
    /// Human readable failure cause, only in `Error`
    pub error: Option<String>,
}

impl DeviceState {
    /// The initial `Idle` state
    pub fn idle() -> Self {
        Self::default()
    }

    /// The state after a teardown
    pub fn disconnected() -> Self {
        Self {
            status: DeviceStatus::Disconnected,
            ..Self::default()
        }
    }

    /// A failed attempt
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: DeviceStatus::Error,
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// The requested transport does not exist on this host
    pub fn unsupported() -> Self {
        Self {
            status: DeviceStatus::Unsupported,
            ..Self::default()
        }
    }

    /// Waiting for a device selection
    pub fn requesting() -> Self {
        Self {
            status: DeviceStatus::Requesting,
            ..Self::default()
        }
    }

    /// A state with a transport attached
    pub fn attached(
        status: DeviceStatus,
        kind: TransportKind,
        name: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            status,
            transport_kind: kind,
            name: Some(name.into()),
            id: Some(id.into()),
            error: None,
        }
    }

    /// Whether the device accepts commands
    pub fn is_connected(&self) -> bool {
        self.status == DeviceStatus::Connected
    }

    /// Check the record's structural rules.
    ///
    /// - a transport is attached exactly in the transport-bearing statuses
    /// - `name`/`id` are only present with a transport
    /// - `error` is only present in `Error`
    pub fn check_invariants(&self) -> Result<(), String> {
        let attached = self.transport_kind != TransportKind::None;
        if attached != self.status.has_transport() {
            return Err(format!(
                "transport {} is inconsistent with status {}",
                self.transport_kind, self.status
            ));
        }
        if !attached && (self.name.is_some() || self.id.is_some()) {
            return Err(format!("status {} carries device metadata", self.status));
        }
        if self.error.is_some() && self.status != DeviceStatus::Error {
            return Err(format!("status {} carries an error", self.status));
        }
        Ok(())
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, &self.error) {
            (Some(name), _) => write!(f, "{} ({} via {})", self.status, name, self.transport_kind),
            (None, Some(err)) => write!(f, "{}: {}", self.status, err),
            (None, None) => write!(f, "{}", self.status),
        }
    }
}
