//! Configuration and settings management for HubLink
//!
//! Provides configuration file handling and validation.
//! Supports JSON and TOML file formats stored in platform-specific directories.
//!
//! Configuration is organized into logical sections:
//! - Serial settings (which ports count as already authorized, reader timeout)
//! - BLE settings (the prioritized GATT profile list, scan window)
//! - REPL settings (import preamble, init pacing)

use crate::error::{SettingsError, SettingsResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// USB vendor id of LEGO hubs
pub const LEGO_VENDOR_ID: u16 = 0x0694;

/// Baud rate the hub REPL listens on; no other rate is accepted
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Serial/USB settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Baud rate for serial connections, always [`DEFAULT_BAUD_RATE`]
    pub baud_rate: u32,
    /// USB vendor ids whose ports may be opened without asking
    pub authorized_vendor_ids: Vec<u16>,
    /// Port picked in an earlier session
    pub remembered_port: Option<String>,
    /// Read timeout of the blocking reader in milliseconds
    pub read_timeout_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            authorized_vendor_ids: vec![LEGO_VENDOR_ID],
            remembered_port: None,
            read_timeout_ms: 10,
        }
    }
}

/// One GATT service profile exposing a REPL
///
/// A profile matches a device when the service exists and carries both the
/// write and the notify characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleProfile {
    /// Human readable profile name
    pub name: String,
    /// Primary service uuid
    pub service: Uuid,
    /// Characteristic commands are written to
    pub write: Uuid,
    /// Characteristic device output is notified on
    pub notify: Uuid,
}

impl BleProfile {
    /// Nordic UART Service, used by MicroPython-style BLE REPLs
    pub fn nordic_uart() -> Self {
        Self {
            name: "Nordic UART".to_string(),
            service: Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e),
            write: Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e),
            notify: Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e),
        }
    }

    /// LEGO Wireless Protocol hub service (one characteristic for both directions)
    pub fn lego_hub() -> Self {
        Self {
            name: "LEGO Hub".to_string(),
            service: Uuid::from_u128(0x00001623_1212_efde_1623_785feabcd123),
            write: Uuid::from_u128(0x00001624_1212_efde_1623_785feabcd123),
            notify: Uuid::from_u128(0x00001624_1212_efde_1623_785feabcd123),
        }
    }
}

/// Bluetooth LE settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleSettings {
    /// Profiles tried in order; the first one that matches wins
    pub profiles: Vec<BleProfile>,
    /// How long to scan before offering devices, in milliseconds
    pub scan_timeout_ms: u64,
    /// Only offer devices whose advertised name starts with this prefix
    pub name_prefix: Option<String>,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            profiles: vec![BleProfile::nordic_uart(), BleProfile::lego_hub()],
            scan_timeout_ms: 3000,
            name_prefix: None,
        }
    }
}

/// REPL initialization settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplSettings {
    /// Statements sent once per connection, in paste mode
    pub preamble_imports: Vec<String>,
    /// Pause between the interrupt and the preamble, in milliseconds
    pub init_delay_ms: u64,
}

impl Default for ReplSettings {
    fn default() -> Self {
        Self {
            preamble_imports: vec![
                "import hub".to_string(),
                "import motor".to_string(),
                "from hub import port, sound".to_string(),
                "import time".to_string(),
            ],
            init_delay_ms: 100,
        }
    }
}

/// Complete application configuration
///
/// Aggregates all settings sections and provides file I/O operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Serial settings
    pub serial: SerialSettings,
    /// Bluetooth LE settings
    pub ble: BleSettings,
    /// REPL settings
    pub repl: ReplSettings,
    /// Resume an authorized serial port on startup
    pub auto_reconnect: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial: SerialSettings::default(),
            ble: BleSettings::default(),
            repl: ReplSettings::default(),
            auto_reconnect: true,
        }
    }
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Platform config location (`<config dir>/hublink/config.toml`)
    pub fn default_config_path() -> SettingsResult<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("hublink").join("config.toml"))
            .ok_or_else(|| {
                SettingsError::ConfigDirectory("no configuration directory on this platform".into())
            })
    }

    /// Load config from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let content = std::fs::read_to_string(path)?;

        let config: Self = match Format::of(path)? {
            Format::Json => serde_json::from_str(&content)?,
            Format::Toml => toml::from_str(&content)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Load config from file, falling back to defaults when the file is absent
    pub fn load_or_default(path: &Path) -> SettingsResult<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from_file(path)
    }

    /// Save config to file (JSON or TOML)
    pub fn save_to_file(&self, path: &Path) -> SettingsResult<()> {
        self.validate()?;

        let content = match Format::of(path)? {
            Format::Json => serde_json::to_string_pretty(self)?,
            Format::Toml => toml::to_string_pretty(self)?,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> SettingsResult<()> {
        if self.serial.baud_rate != DEFAULT_BAUD_RATE {
            return Err(SettingsError::invalid(
                "serial.baud_rate",
                format!(
                    "the hub only talks at {} baud, got {}",
                    DEFAULT_BAUD_RATE, self.serial.baud_rate
                ),
            ));
        }

        if self.serial.read_timeout_ms == 0 {
            return Err(SettingsError::invalid("serial.read_timeout_ms", "must be > 0"));
        }

        if self.ble.profiles.is_empty() {
            return Err(SettingsError::invalid(
                "ble.profiles",
                "at least one profile is required",
            ));
        }

        for (index, profile) in self.ble.profiles.iter().enumerate() {
            if profile.service.is_nil() || profile.write.is_nil() || profile.notify.is_nil() {
                return Err(SettingsError::invalid(
                    format!("ble.profiles[{}]", index),
                    "service, write and notify uuids must be set",
                ));
            }
        }

        if self.ble.scan_timeout_ms == 0 {
            return Err(SettingsError::invalid("ble.scan_timeout_ms", "must be > 0"));
        }

        if self
            .repl
            .preamble_imports
            .iter()
            .any(|line| line.contains('\u{4}') || line.contains('\u{5}'))
        {
            return Err(SettingsError::invalid(
                "repl.preamble_imports",
                "statements must not contain paste-mode control bytes",
            ));
        }

        Ok(())
    }

    /// Remember the port of a successful connection
    pub fn remember_port(&mut self, port: impl Into<String>) {
        self.serial.remembered_port = Some(port.into());
    }
}

enum Format {
    Json,
    Toml,
}

impl Format {
    fn of(path: &Path) -> SettingsResult<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Ok(Format::Json),
            Some("toml") => Ok(Format::Toml),
            other => Err(SettingsError::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }
}
