//! Type definitions for periph
//!
//! Shared immutable value types used across the workspace:
//! - Device configuration ([`DeviceDescriptor`])
//! - Command surface ([`DeviceCommand`], [`CommandResult`], [`CommandSpec`])
//! - Health and alarm reporting ([`StatusSnapshot`], [`StatusEvent`])
//! - Structured error codes ([`ErrorCode`])

pub mod code;
pub mod command;
pub mod descriptor;
pub mod error;
pub mod status;

pub use code::ErrorCode;
pub use command::{CommandOrigin, CommandResult, CommandSpec, DeviceCommand};
pub use descriptor::{DeviceDescriptor, DeviceModel, TransportConfig};
pub use error::{Error, Result};
pub use status::{Health, Severity, StatusEvent, StatusSnapshot};
