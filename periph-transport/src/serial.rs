//! Serial transport

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, trace, warn};

use crate::{error::*, Transport};

/// Serial transport for directly attached peripherals
pub struct SerialTransport {
    path: String,
    baud: u32,
    stream: Option<SerialStream>,
}

impl SerialTransport {
    /// Create a new serial transport
    pub fn new(path: impl Into<String>, baud: u32) -> Self {
        Self {
            path: path.into(),
            baud,
            stream: None,
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Err(Error::AlreadyConnected);
        }

        debug!("Opening serial port {} at {} baud...", self.path, self.baud);

        let stream = tokio_serial::new(&self.path, self.baud)
            .open_native_async()
            .map_err(|e| Error::Serial(format!("{}: {}", self.path, e)))?;

        debug!("Opened {}", self.path);

        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            debug!("Closing serial port {}...", self.path);
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        trace!(
            "Sending {} bytes: {}",
            data.len(),
            hex::encode_upper(&data[..data.len().min(32)])
        );

        stream.write_all(data).await?;
        stream.flush().await?;

        Ok(())
    }

    async fn recv(&mut self) -> Result<Bytes> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        let mut buf = BytesMut::with_capacity(256);

        let n = stream.read_buf(&mut buf).await.map_err(Error::Io)?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }

        trace!(
            "Received {} bytes: {}",
            n,
            hex::encode_upper(&buf[..n.min(32)])
        );

        Ok(buf.freeze())
    }

    fn endpoint(&self) -> String {
        format!("{}@{}", self.path, self.baud)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if self.is_open() {
            warn!("Serial transport dropped while still open");
        }
    }
}
