//! Health snapshots and alarms

use std::fmt;

use chrono::{DateTime, Utc};

use crate::code::ErrorCode;
use crate::descriptor::DeviceModel;

/// Alarm severity, ordered from least to most severe.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// One alarm raised by a driver's status decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// Short stable alarm code (e.g. `CST6_LOW`)
    pub code: String,

    /// Human-readable default message
    pub message: String,

    pub severity: Severity,

    pub timestamp: DateTime<Utc>,

    /// Structured code for the external message table, when one applies
    pub error_code: Option<ErrorCode>,
}

impl StatusEvent {
    pub fn new(code: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            severity,
            timestamp: Utc::now(),
            error_code: None,
        }
    }

    pub fn with_error_code(mut self, code: ErrorCode) -> Self {
        self.error_code = Some(code);
        self
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.code, self.message)
    }
}

/// Device health as last observed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Health {
    Online,
    Offline,
}

/// The latest known truth about one device.
///
/// Immutable value; a newer snapshot wholly replaces the previous one in the
/// status store.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub device_name: String,
    pub model: DeviceModel,
    pub health: Health,
    pub timestamp: DateTime<Utc>,
    pub alarms: Vec<StatusEvent>,
}

impl StatusSnapshot {
    pub fn online(device_name: impl Into<String>, model: DeviceModel, alarms: Vec<StatusEvent>) -> Self {
        Self {
            device_name: device_name.into(),
            model,
            health: Health::Online,
            timestamp: Utc::now(),
            alarms,
        }
    }

    pub fn offline(device_name: impl Into<String>, model: DeviceModel, alarm: StatusEvent) -> Self {
        Self {
            device_name: device_name.into(),
            model,
            health: Health::Offline,
            timestamp: Utc::now(),
            alarms: vec![alarm],
        }
    }

    /// True when any alarm is at Error severity or above.
    pub fn has_fault(&self) -> bool {
        self.alarms.iter().any(|a| a.severity >= Severity::Error)
    }

    pub fn is_online(&self) -> bool {
        self.health == Health::Online
    }
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {:?}, {} alarm(s)",
            self.device_name,
            self.model,
            self.health,
            self.alarms.len()
        )
    }
}
