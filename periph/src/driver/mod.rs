//! Device drivers
//!
//! A driver hides all protocol detail behind three operations: initialize,
//! poll status, execute a named command. The supervisor depends on nothing
//! else; swapping a dispenser generation or a scanner vendor is a driver
//! change only.

pub mod cdm;
pub mod scanner;

pub use cdm::CdmDriver;
pub use scanner::ScannerDriver;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

#[cfg(test)]
use mockall::automock;

use periph_core::ssi::DecodeEvent;
use periph_transport::{ConfigFactory, TransportFactory};
use periph_types::{
    CommandResult, CommandSpec, DeviceCommand, DeviceDescriptor, DeviceModel, StatusSnapshot,
};

use crate::client::CdmVariant;
use crate::error::Result;

/// Everything the supervisor needs from one connected device.
///
/// `Err` from any operation means the conversation itself broke (transport
/// or protocol); a device-reported failure is an `Ok` result carrying
/// `success == false`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeviceDriver: Send {
    /// Bring the device to a ready state and report its initial status.
    async fn initialize(&mut self) -> Result<StatusSnapshot>;

    /// Poll current status.
    async fn get_status(&mut self) -> Result<StatusSnapshot>;

    /// Execute one named command from the catalog.
    async fn execute(&mut self, command: &DeviceCommand) -> Result<CommandResult>;

    /// Release the connection; best effort.
    async fn shutdown(&mut self);

    fn name(&self) -> &str;

    /// Static list of supported commands, consumed by UI pickers.
    fn catalog(&self) -> &'static [CommandSpec];

    /// Stream of unsolicited data (barcode reads), when the device has one.
    fn subscribe_data(&self) -> Option<broadcast::Receiver<DecodeEvent>> {
        None
    }

    /// Flips to true when the underlying connection is gone.
    fn disconnected(&self) -> watch::Receiver<bool>;
}

/// Builds a fresh driver (and connection) per supervisor attempt.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn build(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn DeviceDriver>>;
}

/// Command catalog for a model, without a connected driver.
pub fn catalog_for(model: DeviceModel) -> &'static [CommandSpec] {
    match model {
        DeviceModel::Cdm10k | DeviceModel::Cdm20k => cdm::CATALOG,
        DeviceModel::SsiScanner => scanner::CATALOG,
    }
}

/// Production factory: maps the descriptor's model and transport config to
/// the matching driver over a freshly opened transport.
pub struct StandardDriverFactory;

#[async_trait]
impl DriverFactory for StandardDriverFactory {
    async fn build(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn DeviceDriver>> {
        let transport = ConfigFactory::new(descriptor.transport.clone()).make();
        match descriptor.model {
            DeviceModel::Cdm10k => Ok(Box::new(
                CdmDriver::connect(descriptor, transport, CdmVariant::Cdm10k).await?,
            )),
            DeviceModel::Cdm20k => Ok(Box::new(
                CdmDriver::connect(descriptor, transport, CdmVariant::Cdm20k).await?,
            )),
            DeviceModel::SsiScanner => {
                Ok(Box::new(ScannerDriver::connect(descriptor, transport).await?))
            }
        }
    }
}
