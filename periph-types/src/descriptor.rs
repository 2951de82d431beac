//! Device configuration descriptors

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Minimum polling interval accepted from configuration.
pub const MIN_POLL_INTERVAL_MS: u64 = 100;

/// Device family/model selector
///
/// The model decides which protocol client, framer and driver a supervisor
/// constructs for the device.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceModel {
    /// Cash dispenser, 10K variant (length-prefixed XOR-checksummed frames)
    Cdm10k,

    /// Cash dispenser, 20K variant (ETX-delimited CRC-16 frames, ENQ heartbeat)
    Cdm20k,

    /// Barcode/QR scanner speaking the SSI packet protocol
    SsiScanner,
}

impl DeviceModel {
    /// Error-code family the model reports under (`DEV.<family>...`)
    pub fn family(self) -> &'static str {
        match self {
            Self::Cdm10k | Self::Cdm20k => "HCDM",
            Self::SsiScanner => "SSI",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Cdm10k => "CDM-10K",
            Self::Cdm20k => "CDM-20K",
            Self::SsiScanner => "SSI-SCANNER",
        }
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Transport endpoint selection for one device
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// TCP socket (serial-over-ethernet converters, emulators)
    Tcp { host: String, port: u16 },

    /// Local serial port
    Serial { path: String, baud: u32 },
}

impl fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Self::Serial { path, baud } => write!(f, "serial://{}@{}", path, baud),
        }
    }
}

/// Immutable per-device configuration
///
/// Created once at startup from external configuration and never mutated.
/// The `name` is the unique routing key for commands and status snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceDescriptor {
    /// Unique device name (routing key)
    pub name: String,

    /// Model, selects driver + protocol
    pub model: DeviceModel,

    /// Transport endpoint
    pub transport: TransportConfig,

    /// Health polling interval in milliseconds
    pub poll_interval_ms: u64,

    /// Disabled devices are configured but never supervised
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl DeviceDescriptor {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Validate the descriptor as loaded from configuration.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("device name must not be empty".into()));
        }
        if self.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            return Err(Error::Validation(format!(
                "poll interval for '{}' must be >= {} ms, got {}",
                self.name, MIN_POLL_INTERVAL_MS, self.poll_interval_ms
            )));
        }
        if let TransportConfig::Serial { path, .. } = &self.transport {
            if path.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "serial path for '{}' must not be empty",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, poll_ms: u64) -> DeviceDescriptor {
        DeviceDescriptor {
            name: name.into(),
            model: DeviceModel::Cdm20k,
            transport: TransportConfig::Tcp {
                host: "127.0.0.1".into(),
                port: 7700,
            },
            poll_interval_ms: poll_ms,
            enabled: true,
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(descriptor("cdm", 2000).validate().is_ok());
    }

    #[test]
    fn test_validate_empty_name() {
        assert!(descriptor("  ", 2000).validate().is_err());
    }

    #[test]
    fn test_validate_poll_interval_too_small() {
        assert!(descriptor("cdm", 50).validate().is_err());
    }

    #[test]
    fn test_model_family() {
        assert_eq!(DeviceModel::Cdm10k.family(), "HCDM");
        assert_eq!(DeviceModel::Cdm20k.family(), "HCDM");
        assert_eq!(DeviceModel::SsiScanner.family(), "SSI");
    }

    #[test]
    fn test_transport_display() {
        let tcp = TransportConfig::Tcp {
            host: "10.0.0.5".into(),
            port: 9100,
        };
        assert_eq!(tcp.to_string(), "tcp://10.0.0.5:9100");

        let serial = TransportConfig::Serial {
            path: "/dev/ttyS1".into(),
            baud: 9600,
        };
        assert_eq!(serial.to_string(), "serial:///dev/ttyS1@9600");
    }
}
