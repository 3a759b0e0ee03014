//! # HubLink
//!
//! Host-side link to a LEGO-style hub running an interactive interpreter:
//! - USB-serial and Bluetooth LE transports behind one device abstraction
//! - Connection lifecycle with cancellation, failure classification and
//!   device-initiated disconnect detection
//! - REPL interrupt/paste-mode framing and serialized, chunked writes
//!
//! ## Architecture
//!
//! HubLink is organized as a workspace with multiple crates:
//!
//! 1. **hublink-core** - Device state, errors, events, shared type aliases
//! 2. **hublink-settings** - Configuration files and validation
//! 3. **hublink-communication** - Transports, REPL codec, write queue, read loop, session
//! 4. **hublink** - This façade plus the `hublink` command line tool

pub use hublink_communication::{
    auto_reconnect, list_ports, repl, AutoReconnectOutcome, BleConnector, ConnectOutcome,
    Connector, DeviceCandidate, DeviceChooser, DeviceSession, LineDecoder, RequestMode,
    SerialConnector, SerialPortInfo, Transport, CHUNK_DELAY, CHUNK_SIZE,
};

pub use hublink_core::{
    ConnectionError, DeviceEvent, DeviceState, DeviceStatus, Error, EventDispatcher, HandleId,
    Result, TransportKind,
};

pub use hublink_settings::{BleProfile, BleSettings, Config, ReplSettings, SerialSettings};

use std::sync::Arc;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging with the default configuration
///
/// Sets up structured logging with:
/// - Pretty formatting on stderr, keeping stdout for device output
/// - RUST_LOG environment variable support (default `info`)
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_line_number(true)
        .pretty();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

/// Build a session with a USB and a Bluetooth connector sharing one chooser
pub fn session_from_config(config: &Config, chooser: Arc<dyn DeviceChooser>) -> DeviceSession {
    let connectors: Vec<Arc<dyn Connector>> = vec![
        Arc::new(SerialConnector::new(config.serial.clone(), Arc::clone(&chooser))),
        Arc::new(BleConnector::new(config.ble.clone(), chooser)),
    ];
    DeviceSession::new(config.repl.clone(), connectors)
}
