//! Cash dispenser driver

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use periph_core::cdm10k::op;
use periph_core::{cdm10k, cdm20k};
use periph_transport::{Channel, Transport};
use periph_types::{
    CommandResult, CommandSpec, DeviceCommand, DeviceDescriptor, DeviceModel, ErrorCode, Severity,
    StatusEvent, StatusSnapshot,
};

use crate::client::{CdmClient, CdmVariant};
use crate::driver::DeviceDriver;
use crate::error::Result;

use async_trait::async_trait;

const FAMILY: &str = "HCDM";

/// Response window for ordinary commands
const PROCESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Command bytes are shared across both dispenser generations
pub(crate) const CATALOG: &[CommandSpec] = &[
    CommandSpec {
        name: "STATUS",
        description: "Read device state",
    },
    CommandSpec {
        name: "SENSOR",
        description: "Read sensor block and decode alarms",
    },
    CommandSpec {
        name: "DISPENSE",
        description: "Dispense notes, payload = cassette/count pairs",
    },
    CommandSpec {
        name: "PURGE",
        description: "Clear the transport path into the reject box",
    },
    CommandSpec {
        name: "RESET",
        description: "Device-level reset",
    },
    CommandSpec {
        name: "VERSION",
        description: "Read firmware revision",
    },
    CommandSpec {
        name: "RESTART",
        description: "Drop and re-establish the connection",
    },
];

/// Driver for both HCDM dispenser generations
pub struct CdmDriver {
    name: String,
    model: DeviceModel,
    client: CdmClient,
    channel: Channel,
}

impl CdmDriver {
    /// Open the transport and stand up the framed channel.
    pub async fn connect(
        descriptor: &DeviceDescriptor,
        mut transport: Box<dyn Transport>,
        variant: CdmVariant,
    ) -> Result<Self> {
        transport.open().await?;
        info!(device = %descriptor.name, endpoint = %transport.endpoint(), "dispenser connected");

        let channel = Channel::start(transport, variant.framer());
        let client = CdmClient::new(channel.clone(), variant);
        Ok(Self {
            name: descriptor.name.clone(),
            model: descriptor.model,
            client,
            channel,
        })
    }

    fn decode_sensors(&self, data: &[u8]) -> Vec<StatusEvent> {
        match self.client.variant() {
            CdmVariant::Cdm10k => cdm10k::decode_sensors(data),
            CdmVariant::Cdm20k => cdm20k::decode_sensors(data),
        }
    }

    /// `(op byte, long-running)` for a catalog name; `None` if unknown.
    fn lookup(name: &str) -> Option<(u8, bool)> {
        match name {
            "STATUS" => Some((op::STATUS, false)),
            "SENSOR" => Some((op::SENSOR, false)),
            "DISPENSE" => Some((op::DISPENSE, true)),
            "PURGE" => Some((op::PURGE, true)),
            "RESET" => Some((op::RESET, true)),
            "VERSION" => Some((op::VERSION, false)),
            _ => None,
        }
    }
}

#[async_trait]
impl DeviceDriver for CdmDriver {
    async fn initialize(&mut self) -> Result<StatusSnapshot> {
        debug!(device = %self.name, "initializing dispenser");
        let result = self
            .client
            .send_command(op::INIT, &[], PROCESS_TIMEOUT, true)
            .await?;
        if !result.success && result.retryable {
            return Err(crate::Error::InvalidResponse(format!(
                "initialization got no usable reply: {}",
                result.message
            )));
        }
        self.get_status().await
    }

    async fn get_status(&mut self) -> Result<StatusSnapshot> {
        let result = self
            .client
            .send_command(op::SENSOR, &[], PROCESS_TIMEOUT, false)
            .await?;

        if result.success {
            let alarms = self.decode_sensors(result.data.as_deref().unwrap_or(&[]));
            return Ok(StatusSnapshot::online(&self.name, self.model, alarms));
        }
        if result.retryable {
            // Timeout or NAK exhaustion, the conversation itself broke
            return Err(crate::Error::InvalidResponse(result.message));
        }
        // The device answered with a failure status; that is an alarm, not
        // a dead connection
        let alarm = StatusEvent::new("STATUS_FAIL", result.message, Severity::Error)
            .with_error_code(
                result
                    .error_code
                    .unwrap_or_else(|| ErrorCode::status_error(FAMILY)),
            );
        Ok(StatusSnapshot::online(&self.name, self.model, vec![alarm]))
    }

    async fn execute(&mut self, command: &DeviceCommand) -> Result<CommandResult> {
        if command.name == "RESTART" {
            // Soft command: the supervisor reconnects on success
            return Ok(CommandResult::ok("restart requested"));
        }

        let Some((cmd, long_running)) = Self::lookup(&command.name) else {
            return Ok(CommandResult::fail(
                format!("dispenser does not support {}", command.name),
                ErrorCode::unknown_command(FAMILY),
                false,
            ));
        };

        let payload = command.payload.as_deref().unwrap_or(&[]);
        let result = self
            .client
            .send_command(cmd, payload, PROCESS_TIMEOUT, long_running)
            .await?;

        if result.success && command.name == "SENSOR" {
            let alarms = self.decode_sensors(result.data.as_deref().unwrap_or(&[]));
            debug!(device = %self.name, alarm_count = alarms.len(), "sensor read");
        }
        Ok(result)
    }

    async fn shutdown(&mut self) {
        debug!(device = %self.name, "shutting down dispenser driver");
        self.channel.close().await;
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn catalog(&self) -> &'static [CommandSpec] {
        CATALOG
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        self.channel.disconnected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use periph_core::{ACK, ENQ};
    use periph_transport::{MemoryPort, MemoryTransport};
    use periph_types::TransportConfig;
    use pretty_assertions::assert_eq;

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor {
            name: "cdm".into(),
            model: DeviceModel::Cdm20k,
            transport: TransportConfig::Tcp {
                host: "127.0.0.1".into(),
                port: 9100,
            },
            poll_interval_ms: 1000,
            enabled: true,
        }
    }

    async fn connected() -> (CdmDriver, MemoryPort) {
        let (transport, port) = MemoryTransport::new();
        let driver = CdmDriver::connect(&descriptor(), Box::new(transport), CdmVariant::Cdm20k)
            .await
            .unwrap();
        (driver, port)
    }

    /// Answer one 20K conversation: ACK, then the given response, then
    /// consume the host's final ACK.
    async fn answer(port: &mut MemoryPort, response: &[u8]) {
        port.recv().await.unwrap();
        port.send(&[ACK]).await.unwrap();
        port.send(response).await.unwrap();
        let fin = port.recv_exact(1).await.unwrap();
        assert_eq!(fin.as_ref(), &[ACK]);
    }

    #[tokio::test]
    async fn test_initialize_then_status() {
        let (mut driver, mut port) = connected().await;

        let script = tokio::spawn(async move {
            let init_ok = cdm20k::build_frame(op::INIT, b"00").unwrap();
            answer(&mut port, &init_ok).await;

            // Cassette 2 paper low
            let mut sensors = b"00".to_vec();
            sensors.extend_from_slice(&[0x02, 0, 0, 0, 0, 0, b'0', b'0', 0, b'0', b'0', b'0']);
            let sensor_ok = cdm20k::build_frame(op::SENSOR, &sensors).unwrap();
            answer(&mut port, &sensor_ok).await;
        });

        let snapshot = driver.initialize().await.unwrap();
        assert!(snapshot.is_online());
        assert!(!snapshot.has_fault());
        assert_eq!(snapshot.alarms.len(), 1);
        assert_eq!(snapshot.alarms[0].code, "CST2_LOW");

        script.await.unwrap();
    }

    #[tokio::test]
    async fn test_status_failure_becomes_alarm() {
        let (mut driver, mut port) = connected().await;

        let script = tokio::spawn(async move {
            let failed = cdm20k::build_frame(op::SENSOR, b"42").unwrap();
            answer(&mut port, &failed).await;
        });

        let snapshot = driver.get_status().await.unwrap();
        assert!(snapshot.is_online());
        assert!(snapshot.has_fault());
        assert_eq!(snapshot.alarms[0].code, "STATUS_FAIL");

        script.await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_dispense_with_heartbeat() {
        let (mut driver, mut port) = connected().await;

        let script = tokio::spawn(async move {
            port.recv().await.unwrap();
            port.send(&[ACK]).await.unwrap();
            port.send(&[ENQ]).await.unwrap();
            let done = cdm20k::build_frame(op::DISPENSE, b"00").unwrap();
            port.send(&done).await.unwrap();
            port.recv_exact(1).await.unwrap();
        });

        let result = driver
            .execute(&DeviceCommand::with_payload("DISPENSE", &b"0102"[..]))
            .await
            .unwrap();
        assert!(result.success);

        script.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_command_rejected_without_wire_traffic() {
        let (mut driver, _port) = connected().await;
        let result = driver
            .execute(&DeviceCommand::named("FORMAT"))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(
            result.error_code.unwrap().to_string(),
            "DEV.HCDM.COMMAND.UNKNOWN_COMMAND"
        );
    }

    #[tokio::test]
    async fn test_restart_is_soft() {
        let (mut driver, _port) = connected().await;
        let result = driver.execute(&DeviceCommand::named("RESTART")).await.unwrap();
        assert!(result.success);
    }

    #[test]
    fn test_catalog_names_resolve() {
        for spec in CATALOG {
            if spec.name != "RESTART" {
                assert!(CdmDriver::lookup(spec.name).is_some(), "{}", spec.name);
            }
        }
        assert!(CdmDriver::lookup("NOPE").is_none());
    }
}
