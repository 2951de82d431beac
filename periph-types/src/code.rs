//! Structured error codes
//!
//! Every alarm and command failure carries a stable dotted code such as
//! `DEV.HCDM.CONNECT.FAIL`. The rendered string is the lookup key an external
//! message table maps to localized text; the structured form keeps the parts
//! addressable without string splitting.

use std::fmt;

/// Domain prefix for all device-layer codes
pub const DOMAIN_DEVICE: &str = "DEV";

/// Code categories
pub mod category {
    pub const CONNECT: &str = "CONNECT";
    pub const STATUS: &str = "STATUS";
    pub const COMMAND: &str = "COMMAND";
    pub const SENSOR: &str = "SENSOR";
}

/// Code reasons shared across families
pub mod reason {
    pub const FAIL: &str = "FAIL";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const ERROR: &str = "ERROR";
    pub const NAK: &str = "NAK";
    pub const UNKNOWN_COMMAND: &str = "UNKNOWN_COMMAND";
}

/// Structured error code `{domain, family, category, reason}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ErrorCode {
    pub domain: &'static str,
    pub family: &'static str,
    pub category: &'static str,
    pub reason: String,
}

impl ErrorCode {
    /// Create a device-domain code.
    pub fn new(family: &'static str, category: &'static str, reason: impl Into<String>) -> Self {
        Self {
            domain: DOMAIN_DEVICE,
            family,
            category,
            reason: reason.into(),
        }
    }

    pub fn connect_fail(family: &'static str) -> Self {
        Self::new(family, category::CONNECT, reason::FAIL)
    }

    pub fn status_error(family: &'static str) -> Self {
        Self::new(family, category::STATUS, reason::ERROR)
    }

    pub fn status_timeout(family: &'static str) -> Self {
        Self::new(family, category::STATUS, reason::TIMEOUT)
    }

    pub fn command_timeout(family: &'static str) -> Self {
        Self::new(family, category::COMMAND, reason::TIMEOUT)
    }

    pub fn command_error(family: &'static str) -> Self {
        Self::new(family, category::COMMAND, reason::ERROR)
    }

    pub fn unknown_command(family: &'static str) -> Self {
        Self::new(family, category::COMMAND, reason::UNKNOWN_COMMAND)
    }

    pub fn sensor(family: &'static str, reason: impl Into<String>) -> Self {
        Self::new(family, category::SENSOR, reason)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.domain, self.family, self.category, self.reason
        )
    }
}
