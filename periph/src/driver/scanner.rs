//! SSI barcode scanner driver

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use periph_core::ssi::{DecodeEvent, Opcode, SsiFramer};
use periph_transport::{Channel, Transport};
use periph_types::{
    CommandResult, CommandSpec, DeviceCommand, DeviceDescriptor, DeviceModel, ErrorCode, Severity,
    StatusEvent, StatusSnapshot,
};

use crate::client::SsiClient;
use crate::driver::DeviceDriver;
use crate::error::Result;

use async_trait::async_trait;

const FAMILY: &str = "SSI";

/// Reply window for scanner commands
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) const CATALOG: &[CommandSpec] = &[
    CommandSpec {
        name: "SCAN_ENABLE",
        description: "Allow the scanner to read barcodes",
    },
    CommandSpec {
        name: "SCAN_DISABLE",
        description: "Inhibit barcode reading",
    },
    CommandSpec {
        name: "START_DECODE",
        description: "Trigger one decode attempt",
    },
    CommandSpec {
        name: "STOP_DECODE",
        description: "Abort the current decode attempt",
    },
    CommandSpec {
        name: "PARAM_SET",
        description: "Set a parameter, payload = [group, param, value, persist?]",
    },
    CommandSpec {
        name: "VERSION",
        description: "Request firmware revision",
    },
    CommandSpec {
        name: "RESET",
        description: "Device-level reset",
    },
    CommandSpec {
        name: "RESTART",
        description: "Drop and re-establish the connection",
    },
];

/// Driver for SSI-speaking barcode scanners
pub struct ScannerDriver {
    name: String,
    model: DeviceModel,
    client: SsiClient,
    channel: Channel,
}

impl ScannerDriver {
    /// Open the transport and stand up the framed channel.
    pub async fn connect(
        descriptor: &DeviceDescriptor,
        mut transport: Box<dyn Transport>,
    ) -> Result<Self> {
        transport.open().await?;
        info!(device = %descriptor.name, endpoint = %transport.endpoint(), "scanner connected");

        let channel = Channel::start(transport, Arc::new(SsiFramer));
        let client = SsiClient::new(channel.clone());
        Ok(Self {
            name: descriptor.name.clone(),
            model: descriptor.model,
            client,
            channel,
        })
    }

    fn lookup(name: &str) -> Option<Opcode> {
        match name {
            "SCAN_ENABLE" => Some(Opcode::ScanEnable),
            "SCAN_DISABLE" => Some(Opcode::ScanDisable),
            "START_DECODE" => Some(Opcode::StartDecode),
            "STOP_DECODE" => Some(Opcode::StopDecode),
            "PARAM_SET" => Some(Opcode::ParamSend),
            "VERSION" => Some(Opcode::RequestRevision),
            "RESET" => Some(Opcode::Reset),
            _ => None,
        }
    }

    fn snapshot_from(&self, result: &CommandResult) -> Result<StatusSnapshot> {
        if result.success {
            return Ok(StatusSnapshot::online(&self.name, self.model, vec![]));
        }
        if result.retryable {
            return Err(crate::Error::InvalidResponse(result.message.clone()));
        }
        let alarm = StatusEvent::new("STATUS_FAIL", result.message.clone(), Severity::Error)
            .with_error_code(
                result
                    .error_code
                    .clone()
                    .unwrap_or_else(|| ErrorCode::status_error(FAMILY)),
            );
        Ok(StatusSnapshot::online(&self.name, self.model, vec![alarm]))
    }
}

#[async_trait]
impl DeviceDriver for ScannerDriver {
    async fn initialize(&mut self) -> Result<StatusSnapshot> {
        debug!(device = %self.name, "enabling scanner");
        let result = self
            .client
            .send_command(Opcode::ScanEnable, &[], false, REPLY_TIMEOUT)
            .await?;
        self.snapshot_from(&result)
    }

    async fn get_status(&mut self) -> Result<StatusSnapshot> {
        // SSI has no status poll; an acknowledged SCAN_ENABLE doubles as a
        // liveness probe and is idempotent
        let result = self
            .client
            .send_command(Opcode::ScanEnable, &[], false, REPLY_TIMEOUT)
            .await?;
        self.snapshot_from(&result)
    }

    async fn execute(&mut self, command: &DeviceCommand) -> Result<CommandResult> {
        if command.name == "RESTART" {
            return Ok(CommandResult::ok("restart requested"));
        }

        let Some(opcode) = Self::lookup(&command.name) else {
            return Ok(CommandResult::fail(
                format!("scanner does not support {}", command.name),
                ErrorCode::unknown_command(FAMILY),
                false,
            ));
        };

        let payload = command.payload.as_deref().unwrap_or(&[]);
        if opcode == Opcode::ParamSend {
            if payload.len() < 3 {
                return Ok(CommandResult::fail(
                    "PARAM_SET needs [group, param, value]",
                    ErrorCode::command_error(FAMILY),
                    false,
                ));
            }
            let persist = payload.get(3) == Some(&0x01);
            return self
                .client
                .set_param(payload[0], payload[1], payload[2], persist, REPLY_TIMEOUT)
                .await;
        }

        self.client
            .send_command(opcode, payload, false, REPLY_TIMEOUT)
            .await
    }

    async fn shutdown(&mut self) {
        debug!(device = %self.name, "shutting down scanner driver");
        // Best effort; the device may already be gone
        let _ = self
            .client
            .send_command(Opcode::ScanDisable, &[], false, Duration::from_millis(300))
            .await;
        self.channel.close().await;
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn catalog(&self) -> &'static [CommandSpec] {
        CATALOG
    }

    fn subscribe_data(&self) -> Option<broadcast::Receiver<DecodeEvent>> {
        Some(self.client.subscribe_decodes())
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        self.channel.disconnected()
    }
}
