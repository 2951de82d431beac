//! Framed transport channel
//!
//! `Channel::start` takes an opened transport and spawns its read pump. The
//! pump owns the transport: it appends received bytes to an accumulation
//! buffer, extracts complete frames with the protocol's framer, and fans
//! each frame out on a broadcast channel. Writes are funneled through the
//! same task over an mpsc queue, so the wire never sees interleaved writes.
//!
//! Subscribers that fall behind skip ahead (bounded broadcast); an
//! unmatched frame nobody is waiting for is simply dropped.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use periph_core::{Frame, Framer};

use crate::error::{Error, Result};
use crate::Transport;

const BROADCAST_CAPACITY: usize = 32;
const WRITE_QUEUE_CAPACITY: usize = 16;

enum WriteRequest {
    Write {
        bytes: Bytes,
        done: oneshot::Sender<Result<()>>,
    },
    Close,
}

/// Handle to a pumping transport; cheap to clone.
#[derive(Clone)]
pub struct Channel {
    write_tx: mpsc::Sender<WriteRequest>,
    frame_tx: broadcast::Sender<Frame>,
    disconnected_rx: watch::Receiver<bool>,
}

impl Channel {
    /// Spawn the read pump over an already-opened transport.
    pub fn start(transport: Box<dyn Transport>, framer: Arc<dyn Framer>) -> Self {
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let (frame_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (disconnected_tx, disconnected_rx) = watch::channel(false);

        tokio::spawn(pump(
            transport,
            framer,
            write_rx,
            frame_tx.clone(),
            disconnected_tx,
        ));

        Self {
            write_tx,
            frame_tx,
            disconnected_rx,
        }
    }

    /// Queue raw bytes for the wire; resolves once written.
    pub async fn write(&self, bytes: Bytes) -> Result<()> {
        let (done, ack) = oneshot::channel();
        self.write_tx
            .send(WriteRequest::Write { bytes, done })
            .await
            .map_err(|_| Error::ChannelClosed)?;
        ack.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Raw frame stream from the pump.
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.frame_tx.subscribe()
    }

    /// First frame matching `predicate`, or `Timeout`.
    pub async fn wait_for_frame<P>(&self, predicate: P, window: Duration) -> Result<Frame>
    where
        P: Fn(&Frame) -> bool,
    {
        let mut rx = self.subscribe();
        next_matching(&mut rx, predicate, window).await
    }

    /// Write `bytes` and await the first frame matching `predicate`.
    ///
    /// The subscription is taken before the write goes out, so a response
    /// racing the write cannot be lost.
    pub async fn send_and_wait<P>(
        &self,
        bytes: Bytes,
        predicate: P,
        window: Duration,
    ) -> Result<Frame>
    where
        P: Fn(&Frame) -> bool,
    {
        let mut rx = self.subscribe();
        self.write(bytes).await?;
        next_matching(&mut rx, predicate, window).await
    }

    /// Flipped to true when the pump exits (EOF, read error or close).
    pub fn disconnected(&self) -> watch::Receiver<bool> {
        self.disconnected_rx.clone()
    }

    /// Stop the pump and close the underlying transport.
    pub async fn close(&self) {
        let _ = self.write_tx.send(WriteRequest::Close).await;
    }
}

/// Await the next frame on `rx` matching `predicate`, within `window`.
///
/// Lagged receivers skip the missed frames and keep going.
pub async fn next_matching<P>(
    rx: &mut broadcast::Receiver<Frame>,
    predicate: P,
    window: Duration,
) -> Result<Frame>
where
    P: Fn(&Frame) -> bool,
{
    timeout(window, async {
        loop {
            match rx.recv().await {
                Ok(frame) if predicate(&frame) => return Ok(frame),
                Ok(frame) => trace!(?frame, "frame did not match, discarded"),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "frame subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::ChannelClosed),
            }
        }
    })
    .await
    .map_err(|_| Error::Timeout(window.as_millis()))?
}

async fn pump(
    mut transport: Box<dyn Transport>,
    framer: Arc<dyn Framer>,
    mut write_rx: mpsc::Receiver<WriteRequest>,
    frame_tx: broadcast::Sender<Frame>,
    disconnected_tx: watch::Sender<bool>,
) {
    let endpoint = transport.endpoint();
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        tokio::select! {
            biased;

            request = write_rx.recv() => match request {
                Some(WriteRequest::Write { bytes, done }) => {
                    let result = transport.send(&bytes).await;
                    let failed = result.is_err();
                    let _ = done.send(result);
                    if failed {
                        debug!(%endpoint, "write failed, stopping pump");
                        break;
                    }
                }
                Some(WriteRequest::Close) | None => {
                    debug!(%endpoint, "channel closed");
                    break;
                }
            },

            received = transport.recv() => match received {
                Ok(bytes) => {
                    buf.extend_from_slice(&bytes);
                    while let Some(frame) = framer.extract(&mut buf) {
                        trace!(%endpoint, ?frame, "extracted frame");
                        // No subscribers is fine, the frame is unsolicited noise
                        let _ = frame_tx.send(frame);
                    }
                }
                Err(e) => {
                    debug!(%endpoint, error = %e, "read pump stopping");
                    break;
                }
            },
        }
    }

    let _ = transport.close().await;
    let _ = disconnected_tx.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemoryTransport;
    use periph_core::cdm10k::{self, Cdm10kFramer};
    use periph_core::ACK;
    use pretty_assertions::assert_eq;

    async fn started() -> (Channel, crate::mem::MemoryPort) {
        let (mut transport, port) = MemoryTransport::new();
        transport.open().await.unwrap();
        let channel = Channel::start(Box::new(transport), Arc::new(Cdm10kFramer));
        (channel, port)
    }

    #[tokio::test]
    async fn test_write_reaches_port() {
        let (channel, mut port) = started().await;
        channel.write(Bytes::from_static(&[0x05])).await.unwrap();
        assert_eq!(port.recv_exact(1).await.unwrap().as_ref(), &[0x05]);
    }

    #[tokio::test]
    async fn test_fragmented_frame_reassembled() {
        let (channel, mut port) = started().await;
        let frame = cdm10k::build_frame(cdm10k::op::STATUS, b"01").unwrap();

        let mut rx = channel.subscribe();
        port.send(&frame[..3]).await.unwrap();
        port.send(&frame[3..]).await.unwrap();

        let received = next_matching(&mut rx, |f| f.is_message(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(received.as_bytes(), &frame[..]);
    }

    #[tokio::test]
    async fn test_send_and_wait_races_response() {
        let (channel, mut port) = started().await;
        let response = cdm10k::build_frame(cdm10k::RSP_OK, b"").unwrap();

        let script = tokio::spawn(async move {
            let request = port.recv_exact(1).await.unwrap();
            assert_eq!(request.as_ref(), &[0x05]);
            port.send(&[ACK]).await.unwrap();
            port.send(&response).await.unwrap();
            port
        });

        // send_and_wait subscribes before writing, so the ACK racing the
        // write cannot be lost; this longer-lived subscription catches the
        // response that follows it
        let mut rx = channel.subscribe();
        let ack = channel
            .send_and_wait(
                Bytes::from_static(&[0x05]),
                |f| f.is_control(ACK),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(ack.is_control(ACK));
        let reply = next_matching(&mut rx, |f| f.is_message(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(cdm10k::decode_response(&reply).unwrap().is_success());

        script.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_frame_timeout() {
        let (channel, _port) = started().await;
        let result = channel
            .wait_for_frame(|f| f.is_message(), Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(Error::Timeout(200))));
    }

    #[tokio::test]
    async fn test_disconnect_on_port_close() {
        let (channel, port) = started().await;
        let mut disconnected = channel.disconnected();
        assert!(!*disconnected.borrow());

        port.close().await;
        disconnected.changed().await.unwrap();
        assert!(*disconnected.borrow());

        // Writes after the pump stopped fail cleanly
        let result = channel.write(Bytes::from_static(&[0x05])).await;
        assert!(matches!(result, Err(Error::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_close_stops_pump() {
        let (channel, _port) = started().await;
        let mut disconnected = channel.disconnected();
        channel.close().await;
        disconnected.changed().await.unwrap();
        assert!(*disconnected.borrow());
    }
}
