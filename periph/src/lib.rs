//! # periph
//!
//! Supervision and protocol plumbing for unattended kiosk peripherals:
//! cash dispensers speaking the HCDM framing variants and barcode scanners
//! speaking SSI.
//!
//! Each configured device gets its own supervisor task that connects,
//! initializes, polls status, executes commands and reconnects after
//! failures; a [`DeviceHost`] owns the supervisors, aggregates their status
//! snapshots and fans lifecycle events out to the embedding application.
//!
//! ## Quick Start
//!
//! ```no_run
//! use periph::{config::HostConfig, DeviceCommand, DeviceHost};
//!
//! #[tokio::main]
//! async fn main() -> periph::Result<()> {
//!     let config = HostConfig::from_file("devices.toml")?;
//!     let host = DeviceHost::start(config).await?;
//!
//!     // Dispense two notes from cassette 1
//!     let result = host
//!         .execute("cdm", DeviceCommand::with_payload("DISPENSE", &b"0102"[..]))
//!         .await?;
//!     println!("{}", result);
//!
//!     host.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod host;
pub mod store;
pub mod supervisor;

// Re-exports
pub use error::{Error, Result};
pub use host::DeviceHost;
pub use store::StatusStore;
pub use supervisor::{DeviceEvent, Supervisor, SupervisorEvent};

// Re-export types
pub use periph_core::ssi::DecodeEvent;
pub use periph_types::{
    CommandResult, CommandSpec, DeviceCommand, DeviceDescriptor, DeviceModel, StatusSnapshot,
};
