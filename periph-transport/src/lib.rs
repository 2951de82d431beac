//! Byte-stream transports and the framed channel
//!
//! A [`Transport`] moves raw bytes to and from one peripheral endpoint (TCP,
//! serial, or an in-memory duplex for tests). A [`Channel`] wraps a connected
//! transport with a read pump that extracts protocol frames and fans them out
//! to subscribers, and serializes all writes through one task.

pub mod channel;
pub mod error;
pub mod mem;
pub mod serial;
pub mod tcp;

pub use channel::Channel;
pub use error::{Error, Result};
pub use mem::{MemoryPort, MemoryTransport};
pub use serial::SerialTransport;
pub use tcp::TcpTransport;

use async_trait::async_trait;
use bytes::Bytes;

use periph_types::TransportConfig;

/// Byte-stream endpoint to one peripheral
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection
    async fn open(&mut self) -> Result<()>;

    /// Tear the connection down
    async fn close(&mut self) -> Result<()>;

    /// Check if the connection is established
    fn is_open(&self) -> bool;

    /// Send raw bytes
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Await the next available bytes; `Err(ConnectionClosed)` on EOF.
    ///
    /// Must be cancel-safe: dropping the future part-way loses no data.
    async fn recv(&mut self) -> Result<Bytes>;

    /// Human-readable endpoint description
    fn endpoint(&self) -> String;
}

/// Builds a fresh, unopened transport for each connection attempt.
pub trait TransportFactory: Send + Sync {
    fn make(&self) -> Box<dyn Transport>;
}

impl<F> TransportFactory for F
where
    F: Fn() -> Box<dyn Transport> + Send + Sync,
{
    fn make(&self) -> Box<dyn Transport> {
        self()
    }
}

/// Factory mapping a [`TransportConfig`] to the matching implementation.
pub struct ConfigFactory {
    config: TransportConfig,
}

impl ConfigFactory {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for ConfigFactory {
    fn make(&self) -> Box<dyn Transport> {
        match &self.config {
            TransportConfig::Tcp { host, port } => {
                Box::new(TcpTransport::new(host.clone(), *port))
            }
            TransportConfig::Serial { path, baud } => {
                Box::new(SerialTransport::new(path.clone(), *baud))
            }
        }
    }
}
