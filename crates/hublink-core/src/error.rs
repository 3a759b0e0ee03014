//! Error handling for HubLink
//!
//! Provides the error types used across the link layer:
//! - Connection errors (transport selection, open, discovery, I/O)
//! - The unified [`Error`] used in public APIs
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Message shown when a BLE device exposes none of the known GATT profiles.
pub const NO_COMPATIBLE_SERVICE_MESSAGE: &str = "No compatible LEGO services found on this device. \
     Make sure the hub firmware exposes a REPL over Bluetooth.";

/// Connection error type
///
/// Represents every way opening or driving a hub link can fail. The first six
/// variants are the classification applied at the point of origin; the rest
/// describe lifecycle misuse and low-level open failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The device chooser was dismissed without a selection
    #[error("Device selection cancelled")]
    UserCancelled,

    /// The host refused access to the device
    #[error("Permission denied: {reason}")]
    PermissionDenied {
        /// The reason reported by the host.
        reason: String,
    },

    /// Port is already claimed by another process
    #[error("Device busy: {port} is already in use by another program")]
    DeviceBusy {
        /// The name of the busy port.
        port: String,
    },

    /// BLE device exposes none of the known profiles
    #[error("{}", NO_COMPATIBLE_SERVICE_MESSAGE)]
    NoCompatibleService,

    /// Mid-session read or write failure
    #[error("Communication failure: {reason}")]
    CommunicationFailure {
        /// The reason for the failure.
        reason: String,
    },

    /// Host lacks the transport capability entirely
    #[error("{transport} is not supported on this host")]
    Unsupported {
        /// The missing transport.
        transport: String,
    },

    /// Operation requires an attached transport
    #[error("Device not connected")]
    NotConnected,

    /// Operation is not valid in the current state
    #[error("Cannot {requested} while {current}")]
    InvalidState {
        /// The current state name.
        current: String,
        /// The requested operation.
        requested: String,
    },

    /// Port not found
    #[error("Port not found: {port}")]
    PortNotFound {
        /// The name of the port that was not found.
        port: String,
    },

    /// Failed to open port
    #[error("Failed to open {port}: {reason}")]
    FailedToOpen {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },
}

impl ConnectionError {
    /// Classify an opaque platform error message.
    ///
    /// Browser-style and OS-level messages are matched loosely: chooser
    /// dismissals become [`ConnectionError::UserCancelled`], security failures
    /// [`ConnectionError::PermissionDenied`], claimed ports
    /// [`ConnectionError::DeviceBusy`]. Anything else is a
    /// [`ConnectionError::CommunicationFailure`].
    pub fn classify_message(port: &str, message: &str) -> Self {
        let lower = message.to_ascii_lowercase();

        if lower.contains("notfounderror")
            || lower.contains("no port selected")
            || lower.contains("no device selected")
            || lower.contains("user cancelled")
            || lower.contains("cancelled by user")
        {
            return ConnectionError::UserCancelled;
        }

        if lower.contains("securityerror")
            || lower.contains("permission denied")
            || lower.contains("access denied")
            || lower.contains("access is denied")
            || lower.contains("user gesture")
        {
            return ConnectionError::PermissionDenied {
                reason: message.to_string(),
            };
        }

        if lower.contains("busy")
            || lower.contains("already open")
            || lower.contains("in use")
            || lower.contains("failed to open serial port")
        {
            return ConnectionError::DeviceBusy {
                port: port.to_string(),
            };
        }

        ConnectionError::CommunicationFailure {
            reason: message.to_string(),
        }
    }

    /// Check if this error is a dismissed device chooser
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ConnectionError::UserCancelled)
    }
}

/// Main error type for HubLink
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Shorthand for a [`ConnectionError::CommunicationFailure`]
    pub fn communication(reason: impl Into<String>) -> Self {
        Error::Connection(ConnectionError::CommunicationFailure {
            reason: reason.into(),
        })
    }

    /// Check if this is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Check if this error is a dismissed device chooser
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Connection(ConnectionError::UserCancelled))
    }

    /// The connection classification of this error.
    ///
    /// Errors raised outside the transport taxonomy count as communication
    /// failures.
    pub fn connection_error(&self) -> ConnectionError {
        match self {
            Error::Connection(e) => e.clone(),
            Error::Io(e) => ConnectionError::CommunicationFailure {
                reason: e.to_string(),
            },
            Error::Other(msg) => ConnectionError::CommunicationFailure {
                reason: msg.clone(),
            },
        }
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
