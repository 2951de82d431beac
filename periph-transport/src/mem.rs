//! In-memory transport
//!
//! Backed by a `tokio::io::duplex` pipe. The [`MemoryPort`] handle is the
//! far end of the pipe; tests and device emulators drive it to play the
//! peripheral's side of a conversation.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::{error::*, Transport};

const PIPE_CAPACITY: usize = 4096;

/// In-memory transport for tests and emulators
pub struct MemoryTransport {
    pending: Option<DuplexStream>,
    stream: Option<DuplexStream>,
}

impl MemoryTransport {
    /// Create a connected pair: the transport and the far-end port.
    pub fn new() -> (Self, MemoryPort) {
        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        (
            Self {
                pending: Some(near),
                stream: None,
            },
            MemoryPort { stream: far },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Err(Error::AlreadyConnected);
        }
        self.stream = Some(self.pending.take().ok_or(Error::ConnectionClosed)?);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        stream.write_all(data).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Bytes> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        let mut buf = BytesMut::with_capacity(256);
        let n = stream.read_buf(&mut buf).await.map_err(Error::Io)?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        Ok(buf.freeze())
    }

    fn endpoint(&self) -> String {
        "mem".into()
    }
}

/// The peripheral's side of a [`MemoryTransport`] pair
pub struct MemoryPort {
    stream: DuplexStream,
}

impl MemoryPort {
    /// Write bytes toward the host.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        Ok(())
    }

    /// Await whatever the host writes next.
    pub async fn recv(&mut self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(256);
        let n = self.stream.read_buf(&mut buf).await.map_err(Error::Io)?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        Ok(buf.freeze())
    }

    /// Await exactly `n` bytes from the host.
    pub async fn recv_exact(&mut self, n: usize) -> Result<Bytes> {
        let mut buf = vec![0u8; n];
        self.stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
                _ => Error::Io(e),
            })?;
        Ok(Bytes::from(buf))
    }

    /// Drop the port, signalling EOF to the host side.
    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_roundtrip() {
        let (mut transport, mut port) = MemoryTransport::new();
        transport.open().await.unwrap();

        transport.send(&[0x02, 0x10, 0x03]).await.unwrap();
        assert_eq!(port.recv_exact(3).await.unwrap().as_ref(), &[0x02, 0x10, 0x03]);

        port.send(&[0x06]).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().as_ref(), &[0x06]);
    }

    #[tokio::test]
    async fn test_eof_after_port_close() {
        let (mut transport, port) = MemoryTransport::new();
        transport.open().await.unwrap();
        port.close().await;

        assert!(matches!(
            transport.recv().await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_open_twice() {
        let (mut transport, _port) = MemoryTransport::new();
        transport.open().await.unwrap();
        assert!(matches!(
            transport.open().await,
            Err(Error::AlreadyConnected)
        ));
    }
}
