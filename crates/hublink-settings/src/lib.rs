//! HubLink Settings Crate
//!
//! Handles application configuration: loading, saving and validating the
//! serial, Bluetooth and REPL sections.

pub mod config;
pub mod error;

pub use config::{
    BleProfile, BleSettings, Config, ReplSettings, SerialSettings, DEFAULT_BAUD_RATE,
    LEGO_VENDOR_ID,
};
pub use error::{SettingsError, SettingsResult};
