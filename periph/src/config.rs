//! Host configuration
//!
//! TOML file listing the devices to supervise:
//!
//! ```toml
//! [[devices]]
//! name = "cdm"
//! model = "cdm20k"
//! poll_interval_ms = 2000
//! transport = { kind = "tcp", host = "192.168.10.50", port = 9100 }
//!
//! [[devices]]
//! name = "scanner"
//! model = "ssi-scanner"
//! poll_interval_ms = 5000
//! transport = { kind = "serial", path = "/dev/ttyUSB0", baud = 9600 }
//! ```

use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use periph_types::DeviceDescriptor;

use crate::error::{Error, Result};

/// Top-level host configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub devices: Vec<DeviceDescriptor>,
}

impl HostConfig {
    /// Load and validate a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&raw)
    }

    /// Parse and validate TOML configuration text.
    ///
    /// Entries that fail validation are dropped with a warning rather than
    /// failing the load; one bad device must not take down the rest.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let mut config: Self =
            toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        config.prune_invalid();
        Ok(config)
    }

    fn prune_invalid(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.devices.retain(|descriptor| {
            if let Err(e) = descriptor.validate() {
                warn!(device = %descriptor.name, error = %e, "skipping invalid device entry");
                return false;
            }
            if !seen.insert(descriptor.name.clone()) {
                warn!(device = %descriptor.name, "skipping duplicate device name");
                return false;
            }
            true
        });
    }

    /// Descriptors that should actually be supervised.
    pub fn enabled_devices(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices.iter().filter(|d| d.enabled)
    }
}
