//! Event system for device lifecycle changes
//!
//! Provides:
//! - Event types for connection and device state changes
//! - Event dispatcher for publishing events to subscribers

use crate::data::{DeviceState, TransportKind};
use tokio::sync::broadcast;

/// Device event types
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// The device state changed
    StateChanged(DeviceState),
    /// Connect sequence completed
    Connected {
        /// Display name of the device
        name: String,
        /// Transport in use
        kind: TransportKind,
    },
    /// The link was torn down
    Disconnected {
        /// Whether the device (not the application) ended the link
        device_initiated: bool,
    },
    /// A connect attempt failed
    ConnectFailed(String),
}

impl std::fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceEvent::StateChanged(state) => write!(f, "State: {}", state),
            DeviceEvent::Connected { name, kind } => write!(f, "Connected to {} via {}", name, kind),
            DeviceEvent::Disconnected { device_initiated } => {
                if *device_initiated {
                    write!(f, "Device disconnected")
                } else {
                    write!(f, "Disconnected")
                }
            }
            DeviceEvent::ConnectFailed(msg) => write!(f, "Connect failed: {}", msg),
        }
    }
}

/// Event dispatcher for publishing events to subscribers
#[derive(Clone)]
pub struct EventDispatcher {
    /// Broadcast sender channel for device events.
    tx: broadcast::Sender<DeviceEvent>,
}

impl EventDispatcher {
    /// Create a new event dispatcher
    ///
    /// # Arguments
    /// * `buffer_size` - Size of the broadcast buffer (default 100)
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer_size);
        Self { tx }
    }

    /// Create a new event dispatcher with default buffer size
    pub fn default_with_buffer() -> Self {
        Self::new(100)
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all subscribers
    ///
    /// Having no subscribers is not an error; the event is simply dropped.
    pub fn publish(&self, event: DeviceEvent) -> usize {
        match self.tx.send(event) {
            Ok(delivered) => delivered,
            Err(unsent) => {
                tracing::trace!("No subscribers for event: {}", unsent.0);
                0
            }
        }
    }

    /// Get number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::default_with_buffer()
    }
}
