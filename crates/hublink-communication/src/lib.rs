//! # HubLink Communication
//!
//! Device transport and REPL protocol layer for HubLink.
//! Drives a hub's interpreter over USB-serial or Bluetooth LE: selects and
//! opens the channel, interrupts and initializes the REPL, serializes framed
//! writes, and delivers device output to a notification sink.

pub mod read_loop;
pub mod reconnect;
pub mod repl;
pub mod session;
pub mod transport;
pub mod write_queue;

pub use read_loop::ReadLoop;
pub use reconnect::{auto_reconnect, AutoReconnectOutcome};
pub use repl::LineDecoder;
pub use session::{ConnectOutcome, DeviceSession};
pub use transport::{
    ble::{select_profile, BleConnector, BleTransport, GattCharacteristic, GattService},
    chunking::{CHUNK_DELAY, CHUNK_SIZE},
    serial::{list_ports, SerialConnector, SerialPortInfo, SerialTransport},
    ChunkSink, Connector, DeviceCandidate, DeviceChooser, FirstDeviceChooser, LinkContext,
    RequestMode, Transport,
};
pub use write_queue::{WriteSerializer, WriteTicket};
