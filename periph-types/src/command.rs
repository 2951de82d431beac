//! Generic command surface shared by drivers and the device host

use std::fmt;

use bytes::Bytes;

use crate::code::ErrorCode;

/// Where a command originated, kept for audit trails.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum CommandOrigin {
    /// Issued by an operator (service menu, remote console)
    Manual,

    /// Issued by the kiosk workflow itself
    #[default]
    Automatic,
}

/// A named command routed to one device.
#[derive(Debug, Clone)]
pub struct DeviceCommand {
    /// Command name from the driver's catalog (e.g. `DISPENSE`)
    pub name: String,

    /// Optional raw payload, interpreted per command
    pub payload: Option<Bytes>,

    pub origin: CommandOrigin,
}

impl DeviceCommand {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: None,
            origin: CommandOrigin::default(),
        }
    }

    pub fn with_payload(name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            payload: Some(payload.into()),
            origin: CommandOrigin::default(),
        }
    }

    pub fn origin(mut self, origin: CommandOrigin) -> Self {
        self.origin = origin;
        self
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let payload_len = self.payload.as_ref().map(Bytes::len).unwrap_or(0);
        write!(
            f,
            "{}({} byte payload, {:?})",
            self.name, payload_len, self.origin
        )
    }
}

/// Catalog entry describing one supported command, consumed by UI pickers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: &'static str,
    pub description: &'static str,
}

/// Outcome of one protocol or driver operation.
///
/// Immutable value; `retryable` tells callers whether blindly re-issuing the
/// command is safe (idempotent status/version reads) or not (dispense).
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
    pub data: Option<Bytes>,
    pub error_code: Option<ErrorCode>,
    pub retryable: bool,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
            error_code: None,
            retryable: false,
        }
    }

    pub fn ok_with_data(message: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data.into()),
            error_code: None,
            retryable: false,
        }
    }

    pub fn fail(message: impl Into<String>, code: ErrorCode, retryable: bool) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            error_code: Some(code),
            retryable,
        }
    }

    /// Attach diagnostic payload bytes (device failure responses often carry them).
    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = Some(data.into());
        self
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.success {
            write!(f, "OK: {}", self.message)
        } else {
            match &self.error_code {
                Some(code) => write!(f, "FAIL[{}]: {}", code, self.message),
                None => write!(f, "FAIL: {}", self.message),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_result() {
        let result = CommandResult::ok("dispensed");
        assert!(result.success);
        assert!(result.error_code.is_none());
        assert!(!result.retryable);
    }

    #[test]
    fn test_fail_result_display() {
        let result = CommandResult::fail(
            "no response",
            ErrorCode::command_timeout("HCDM"),
            true,
        );
        assert!(!result.success);
        assert!(result.retryable);
        assert_eq!(result.to_string(), "FAIL[DEV.HCDM.COMMAND.TIMEOUT]: no response");
    }

    #[test]
    fn test_command_payload() {
        let cmd = DeviceCommand::with_payload("DISPENSE", vec![2u8, 0, 1]);
        assert_eq!(cmd.payload.as_ref().unwrap().as_ref(), &[2, 0, 1]);
        assert_eq!(cmd.origin, CommandOrigin::Automatic);

        let manual = DeviceCommand::named("RESET").origin(CommandOrigin::Manual);
        assert_eq!(manual.origin, CommandOrigin::Manual);
    }
}
