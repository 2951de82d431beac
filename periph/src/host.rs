//! Device host
//!
//! Owns one supervisor per enabled device, funnels their lifecycle events
//! into the status store and re-broadcasts them to the embedding
//! application. Commands are routed to a device by name.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use periph_types::{CommandResult, CommandSpec, DeviceCommand, DeviceModel, StatusSnapshot};

use crate::config::HostConfig;
use crate::driver::{self, DriverFactory, StandardDriverFactory};
use crate::error::{Error, Result};
use crate::store::StatusStore;
use crate::supervisor::{DeviceEvent, Supervisor, SupervisorEvent, SupervisorHandle};

const EVENT_QUEUE_CAPACITY: usize = 64;
const EVENT_FANOUT_CAPACITY: usize = 64;

/// Top-level owner of all supervised devices
pub struct DeviceHost {
    handles: HashMap<String, SupervisorHandle>,
    models: HashMap<String, DeviceModel>,
    supervisors: Vec<Supervisor>,
    store: Arc<StatusStore>,
    events_out: broadcast::Sender<SupervisorEvent>,
    shutdown_tx: watch::Sender<bool>,
    fan_in: JoinHandle<()>,
}

impl DeviceHost {
    /// Start supervision for every enabled device in the configuration.
    pub async fn start(config: HostConfig) -> Result<Self> {
        Self::start_with_factory(config, Arc::new(StandardDriverFactory)).await
    }

    /// Start with a custom driver factory (tests, emulators).
    pub async fn start_with_factory(
        config: HostConfig,
        factory: Arc<dyn DriverFactory>,
    ) -> Result<Self> {
        let store = Arc::new(StatusStore::new());
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (events_out, _) = broadcast::channel(EVENT_FANOUT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut handles = HashMap::new();
        let mut models = HashMap::new();
        let mut supervisors = Vec::new();
        for descriptor in config.enabled_devices() {
            info!(device = %descriptor.name, model = %descriptor.model, endpoint = %descriptor.transport, "supervising");
            models.insert(descriptor.name.clone(), descriptor.model);
            let supervisor = Supervisor::spawn(
                descriptor.clone(),
                Arc::clone(&factory),
                events_tx.clone(),
                shutdown_rx.clone(),
            );
            handles.insert(descriptor.name.clone(), supervisor.handle());
            supervisors.push(supervisor);
        }
        drop(events_tx);

        let fan_in = tokio::spawn(fan_in(events_rx, Arc::clone(&store), events_out.clone()));

        Ok(Self {
            handles,
            models,
            supervisors,
            store,
            events_out,
            shutdown_tx,
            fan_in,
        })
    }

    /// Route a command to a device by name.
    pub async fn execute(&self, device: &str, command: DeviceCommand) -> Result<CommandResult> {
        let handle = self
            .handles
            .get(device)
            .ok_or_else(|| Error::UnknownDevice(device.into()))?;
        handle.execute(command).await
    }

    /// Latest snapshot for one device.
    pub fn status(&self, device: &str) -> Option<StatusSnapshot> {
        self.store.get(device)
    }

    /// Shared status store.
    pub fn store(&self) -> Arc<StatusStore> {
        Arc::clone(&self.store)
    }

    /// Supported commands for a configured device.
    pub fn catalog(&self, device: &str) -> Result<&'static [CommandSpec]> {
        self.models
            .get(device)
            .map(|model| driver::catalog_for(*model))
            .ok_or_else(|| Error::UnknownDevice(device.into()))
    }

    /// Names of all supervised devices.
    pub fn devices(&self) -> Vec<&str> {
        self.handles.keys().map(String::as_str).collect()
    }

    /// Live stream of lifecycle events from every device.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events_out.subscribe()
    }

    /// Stop every supervisor and wait for them to wind down.
    pub async fn shutdown(self) {
        info!("device host shutting down");
        let _ = self.shutdown_tx.send(true);
        for supervisor in self.supervisors {
            supervisor.join().await;
        }
        let _ = self.fan_in.await;
    }
}

/// Apply snapshots to the store and re-broadcast everything.
async fn fan_in(
    mut events_rx: mpsc::Receiver<SupervisorEvent>,
    store: Arc<StatusStore>,
    events_out: broadcast::Sender<SupervisorEvent>,
) {
    while let Some(event) = events_rx.recv().await {
        if let DeviceEvent::StatusUpdated(snapshot) = &event.event {
            store.apply(snapshot.clone());
        }
        // No listeners is fine
        let _ = events_out.send(event);
    }
    debug!("event fan-in stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DeviceDriver, MockDeviceDriver};
    use async_trait::async_trait;
    use periph_types::DeviceDescriptor;
    use pretty_assertions::assert_eq;

    /// Builds a fresh healthy mock for every connection attempt.
    struct HealthyFactory {
        link: watch::Sender<bool>,
    }

    impl HealthyFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                link: watch::channel(false).0,
            })
        }
    }

    #[async_trait]
    impl DriverFactory for HealthyFactory {
        async fn build(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn DeviceDriver>> {
            let name = descriptor.name.clone();
            let model = descriptor.model;
            let snapshot = move || Ok(StatusSnapshot::online(name.clone(), model, vec![]));

            let mut mock = MockDeviceDriver::new();
            mock.expect_initialize().returning(snapshot.clone());
            mock.expect_get_status().returning(snapshot);
            mock.expect_execute()
                .returning(|_| Ok(CommandResult::ok("done")));
            mock.expect_subscribe_data().returning(|| None);
            let rx = self.link.subscribe();
            mock.expect_disconnected().returning(move || rx.clone());
            mock.expect_shutdown().returning(|| ());
            Ok(Box::new(mock))
        }
    }

    const CONFIG: &str = r#"
        [[devices]]
        name = "cdm"
        model = "cdm20k"
        poll_interval_ms = 200
        transport = { kind = "tcp", host = "127.0.0.1", port = 9100 }

        [[devices]]
        name = "scanner"
        model = "ssi-scanner"
        poll_interval_ms = 200
        transport = { kind = "serial", path = "/dev/ttyUSB0", baud = 9600 }
    "#;

    #[tokio::test(start_paused = true)]
    async fn test_store_tracks_all_devices() {
        let config = HostConfig::from_toml(CONFIG).unwrap();
        let host = DeviceHost::start_with_factory(config, HealthyFactory::new())
            .await
            .unwrap();

        let mut events = host.subscribe();
        let mut online = std::collections::HashSet::new();
        while online.len() < 2 {
            let event = events.recv().await.unwrap();
            if matches!(event.event, DeviceEvent::StatusUpdated(_)) {
                online.insert(event.device);
            }
        }

        assert!(host.status("cdm").unwrap().is_online());
        assert!(host.status("scanner").unwrap().is_online());
        assert_eq!(host.store().all().len(), 2);

        host.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_routes_by_name() {
        let config = HostConfig::from_toml(CONFIG).unwrap();
        let host = DeviceHost::start_with_factory(config, HealthyFactory::new())
            .await
            .unwrap();

        let result = host
            .execute("cdm", DeviceCommand::named("VERSION"))
            .await
            .unwrap();
        assert!(result.success);

        assert!(matches!(
            host.execute("printer", DeviceCommand::named("VERSION")).await,
            Err(Error::UnknownDevice(_))
        ));

        host.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_catalog_by_device() {
        let config = HostConfig::from_toml(CONFIG).unwrap();
        let host = DeviceHost::start_with_factory(config, HealthyFactory::new())
            .await
            .unwrap();

        let cdm = host.catalog("cdm").unwrap();
        assert!(cdm.iter().any(|spec| spec.name == "DISPENSE"));

        let scanner = host.catalog("scanner").unwrap();
        assert!(scanner.iter().any(|spec| spec.name == "SCAN_ENABLE"));

        assert!(host.catalog("printer").is_err());
        host.shutdown().await;
    }
}
