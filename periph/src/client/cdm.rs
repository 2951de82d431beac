//! Cash dispenser client
//!
//! One implementation drives both HCDM framing variants; the variant
//! supplies the frame builder, checksum, handshake window and retry policy.
//!
//! A command runs in three phases: write the frame and await ACK (resending
//! on NAK or silence up to the variant's cap), await the multi-byte
//! response within a deadline, then ACK the response back to the device.
//! The 20K variant extends the response deadline whenever the device sends
//! an ENQ heartbeat; the 10K variant instead uses one long fixed deadline
//! for commands flagged long-running.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use periph_core::{cdm10k, cdm20k, Frame, Framer, ACK, ENQ, NAK};
use periph_transport::{channel::next_matching, Channel};
use periph_types::{code, CommandResult, ErrorCode};

use crate::error::Result;

/// Fixed deadline for 10K commands flagged long-running
const LONG_DEADLINE: Duration = Duration::from_secs(60);

/// Wire-level differences between the two dispenser generations.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CdmVariant {
    Cdm10k,
    Cdm20k,
}

impl CdmVariant {
    pub fn framer(&self) -> Arc<dyn Framer> {
        match self {
            Self::Cdm10k => Arc::new(cdm10k::Cdm10kFramer),
            Self::Cdm20k => Arc::new(cdm20k::Cdm20kFramer),
        }
    }

    fn build_frame(&self, cmd: u8, data: &[u8]) -> periph_core::Result<Bytes> {
        match self {
            Self::Cdm10k => cdm10k::build_frame(cmd, data),
            Self::Cdm20k => cdm20k::build_frame(cmd, data),
        }
    }

    fn verify(&self, frame: &[u8]) -> periph_core::Result<()> {
        match self {
            Self::Cdm10k => cdm10k::verify(frame),
            Self::Cdm20k => cdm20k::verify(frame),
        }
    }

    fn decode(&self, frame: &Frame) -> periph_core::Result<CdmResponse> {
        match self {
            Self::Cdm10k => {
                let response = cdm10k::decode_response(frame)?;
                Ok(CdmResponse {
                    success: response.is_success(),
                    status: (response.cmd as char).to_string(),
                    data: response.data,
                })
            }
            Self::Cdm20k => {
                let response = cdm20k::decode_response(frame)?;
                Ok(CdmResponse {
                    success: response.is_success(),
                    status: response.status,
                    data: response.data,
                })
            }
        }
    }

    fn ack_wait(&self) -> Duration {
        match self {
            Self::Cdm10k => cdm10k::ACK_WAIT,
            Self::Cdm20k => cdm20k::ACK_WAIT,
        }
    }

    fn max_nak(&self) -> usize {
        match self {
            Self::Cdm10k => cdm10k::MAX_NAK,
            Self::Cdm20k => cdm20k::MAX_NAK,
        }
    }

    /// 10K probes a silent device with ENQ mid-window; 20K never does.
    fn probes_with_enq(&self) -> bool {
        matches!(self, Self::Cdm10k)
    }

    /// ENQ received during the response wait extends the deadline (20K only).
    fn enq_extension(&self) -> Option<Duration> {
        match self {
            Self::Cdm10k => None,
            Self::Cdm20k => Some(cdm20k::ENQ_EXTENSION),
        }
    }
}

/// Variant-independent view of a response frame.
#[derive(Debug, Clone)]
struct CdmResponse {
    success: bool,
    status: String,
    data: Bytes,
}

/// Client for one connected cash dispenser
pub struct CdmClient {
    channel: Channel,
    variant: CdmVariant,
}

impl CdmClient {
    pub fn new(channel: Channel, variant: CdmVariant) -> Self {
        Self { channel, variant }
    }

    pub fn variant(&self) -> CdmVariant {
        self.variant
    }

    /// Run one command conversation end to end.
    ///
    /// `process_timeout` bounds the response wait for ordinary commands;
    /// `long_running` selects the variant's long-command policy instead.
    pub async fn send_command(
        &self,
        cmd: u8,
        payload: &[u8],
        process_timeout: Duration,
        long_running: bool,
    ) -> Result<CommandResult> {
        let frame = self.variant.build_frame(cmd, payload)?;
        let mut rx = self.channel.subscribe();

        if !self.handshake(&frame, &mut rx).await? {
            return Ok(CommandResult::fail(
                format!(
                    "no ACK after {} attempt(s)",
                    self.variant.max_nak() + 1
                ),
                ErrorCode::new("HCDM", code::category::COMMAND, code::reason::NAK),
                true,
            ));
        }

        let window = if long_running && self.variant.enq_extension().is_none() {
            LONG_DEADLINE
        } else {
            process_timeout
        };
        let response = match self.await_response(&mut rx, window).await? {
            Some(response) => response,
            None => {
                return Ok(CommandResult::fail(
                    format!("no response within {} ms", window.as_millis()),
                    ErrorCode::command_timeout("HCDM"),
                    true,
                ));
            }
        };

        // Protocol requires acknowledging the response either way
        self.channel.write(Bytes::from_static(&[ACK])).await?;

        if response.success {
            Ok(CommandResult::ok_with_data(
                format!("command {} completed", cmd as char),
                response.data,
            ))
        } else {
            debug!(status = %response.status, "device reported failure");
            Ok(CommandResult::fail(
                format!("device status {}", response.status),
                ErrorCode::new("HCDM", code::category::STATUS, response.status),
                false,
            )
            .with_data(response.data))
        }
    }

    /// Write the frame and await ACK, resending up to the variant's cap.
    ///
    /// Returns false once the cap is exhausted without an ACK.
    async fn handshake(
        &self,
        frame: &Bytes,
        rx: &mut tokio::sync::broadcast::Receiver<Frame>,
    ) -> Result<bool> {
        for attempt in 0..=self.variant.max_nak() {
            if attempt > 0 {
                warn!(attempt, "resending frame");
            }
            self.channel.write(frame.clone()).await?;

            match self.await_control(rx).await? {
                Some(byte) if byte == ACK => return Ok(true),
                Some(_) => trace!("device NAKed, will resend"),
                None => trace!("no handshake reply, will resend"),
            }
        }
        Ok(false)
    }

    /// Await ACK or NAK within the handshake window.
    ///
    /// The 10K probes with a single ENQ at the half-window mark when the
    /// device stays silent.
    async fn await_control(
        &self,
        rx: &mut tokio::sync::broadcast::Receiver<Frame>,
    ) -> Result<Option<u8>> {
        let is_handshake = |f: &Frame| f.is_control(ACK) || f.is_control(NAK);
        let window = self.variant.ack_wait();

        if self.variant.probes_with_enq() {
            let half = window / 2;
            if let Ok(frame) = next_matching(rx, is_handshake, half).await {
                return Ok(frame.first());
            }
            self.channel.write(Bytes::from_static(&[ENQ])).await?;
            match next_matching(rx, is_handshake, window - half).await {
                Ok(frame) => Ok(frame.first()),
                Err(periph_transport::Error::Timeout(_)) => Ok(None),
                Err(e) => Err(e.into()),
            }
        } else {
            match next_matching(rx, is_handshake, window).await {
                Ok(frame) => Ok(frame.first()),
                Err(periph_transport::Error::Timeout(_)) => Ok(None),
                Err(e) => Err(e.into()),
            }
        }
    }

    /// Await the response frame, extending the deadline on 20K ENQs.
    ///
    /// A frame whose checksum does not re-verify is ignored and the wait
    /// continues. Returns `None` on deadline expiry.
    async fn await_response(
        &self,
        rx: &mut tokio::sync::broadcast::Receiver<Frame>,
        window: Duration,
    ) -> Result<Option<CdmResponse>> {
        let mut deadline = Instant::now() + window;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let wanted = |f: &Frame| f.is_message() || f.is_control(ENQ);
            let frame = match next_matching(rx, wanted, remaining).await {
                Ok(frame) => frame,
                Err(periph_transport::Error::Timeout(_)) => return Ok(None),
                Err(e) => return Err(e.into()),
            };

            if frame.is_control(ENQ) {
                if let Some(extension) = self.variant.enq_extension() {
                    trace!("ENQ heartbeat, extending response deadline");
                    deadline += extension;
                }
                continue;
            }

            if let Err(e) = self.variant.verify(frame.as_bytes()) {
                warn!(error = %e, "response failed verification, still waiting");
                continue;
            }
            return Ok(Some(self.variant.decode(&frame)?));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use periph_core::cdm20k::op;
    use periph_transport::{MemoryPort, MemoryTransport, Transport};
    use pretty_assertions::assert_eq;

    async fn client(variant: CdmVariant) -> (CdmClient, MemoryPort) {
        let (mut transport, port) = MemoryTransport::new();
        transport.open().await.unwrap();
        let channel = Channel::start(Box::new(transport), variant.framer());
        (CdmClient::new(channel, variant), port)
    }

    #[tokio::test]
    async fn test_20k_command_success() {
        let (client, mut port) = client(CdmVariant::Cdm20k).await;
        let request = cdm20k::build_frame(op::STATUS, b"").unwrap();
        let response = cdm20k::build_frame(op::STATUS, b"00DATA").unwrap();

        let script = tokio::spawn(async move {
            let received = port.recv_exact(request.len()).await.unwrap();
            assert_eq!(received, request);
            port.send(&[ACK]).await.unwrap();
            port.send(&response).await.unwrap();
            // Final ACK from the host
            let fin = port.recv_exact(1).await.unwrap();
            assert_eq!(fin.as_ref(), &[ACK]);
        });

        let result = client
            .send_command(op::STATUS, b"", Duration::from_secs(1), false)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.data.unwrap().as_ref(), b"DATA");

        script.await.unwrap();
    }

    #[tokio::test]
    async fn test_20k_device_failure_status() {
        let (client, mut port) = client(CdmVariant::Cdm20k).await;
        let response = cdm20k::build_frame(op::DISPENSE, b"31DIAG").unwrap();

        let script = tokio::spawn(async move {
            port.recv().await.unwrap();
            port.send(&[ACK]).await.unwrap();
            port.send(&response).await.unwrap();
            port.recv_exact(1).await.unwrap();
        });

        let result = client
            .send_command(op::DISPENSE, b"0102", Duration::from_secs(1), false)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(!result.retryable);
        assert_eq!(
            result.error_code.unwrap().to_string(),
            "DEV.HCDM.STATUS.31"
        );
        assert_eq!(result.data.unwrap().as_ref(), b"DIAG");

        script.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_20k_nak_retry_bound() {
        // MAX_NAK = 1 for the 20K: expect the initial write plus exactly one
        // resend, then failure
        let (client, mut port) = client(CdmVariant::Cdm20k).await;
        let request = cdm20k::build_frame(op::STATUS, b"").unwrap();
        let request_len = request.len();

        let script = tokio::spawn(async move {
            for _ in 0..2 {
                let received = port.recv_exact(request_len).await.unwrap();
                assert_eq!(received, request);
                port.send(&[periph_core::NAK]).await.unwrap();
            }
            // Nothing further may arrive besides channel teardown
            assert!(port.recv().await.is_err());
        });

        let result = client
            .send_command(op::STATUS, b"", Duration::from_secs(1), false)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.retryable);
        assert_eq!(
            result.error_code.unwrap().to_string(),
            "DEV.HCDM.COMMAND.NAK"
        );

        drop(client);
        script.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_10k_nak_retry_bound() {
        // MAX_NAK = 3 for the 10K: four writes in all. A prompt NAK triggers
        // an immediate resend; silence draws a single ENQ probe at the
        // half-window mark before the attempt is given up
        let (client, mut port) = client(CdmVariant::Cdm10k).await;
        let request = cdm10k::build_frame(cdm10k::op::STATUS, b"").unwrap();
        let request_len = request.len();

        let script = tokio::spawn(async move {
            // Attempts 1 and 2: NAK right away, no probe expected
            for _ in 0..2 {
                let received = port.recv_exact(request_len).await.unwrap();
                assert_eq!(received, request);
                port.send(&[periph_core::NAK]).await.unwrap();
            }
            // Attempts 3 and 4: stay silent, the host probes with ENQ
            for _ in 0..2 {
                let received = port.recv_exact(request_len).await.unwrap();
                assert_eq!(received, request);
                let probe = port.recv_exact(1).await.unwrap();
                assert_eq!(probe.as_ref(), &[ENQ]);
            }
            // Nothing further may arrive besides channel teardown
            assert!(port.recv().await.is_err());
        });

        let result = client
            .send_command(cdm10k::op::STATUS, b"", Duration::from_secs(1), false)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.retryable);
        assert_eq!(result.message, "no ACK after 4 attempt(s)");
        assert_eq!(
            result.error_code.unwrap().to_string(),
            "DEV.HCDM.COMMAND.NAK"
        );

        drop(client);
        script.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_20k_enq_extends_deadline() {
        let (client, mut port) = client(CdmVariant::Cdm20k).await;
        let response = cdm20k::build_frame(op::DISPENSE, b"00").unwrap();

        let script = tokio::spawn(async move {
            port.recv().await.unwrap();
            port.send(&[ACK]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            port.send(&[ENQ]).await.unwrap();
            // Past the original 1 s deadline, inside the 3 s extension
            tokio::time::sleep(Duration::from_millis(2800)).await;
            port.send(&response).await.unwrap();
            port.recv_exact(1).await.unwrap();
        });

        let result = client
            .send_command(op::DISPENSE, b"0101", Duration::from_secs(1), true)
            .await
            .unwrap();
        assert!(result.success);

        script.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_20k_times_out_without_enq() {
        let (client, mut port) = client(CdmVariant::Cdm20k).await;
        let response = cdm20k::build_frame(op::DISPENSE, b"00").unwrap();

        let script = tokio::spawn(async move {
            port.recv().await.unwrap();
            port.send(&[ACK]).await.unwrap();
            // Same late response, but no heartbeat first
            tokio::time::sleep(Duration::from_millis(2900)).await;
            let _ = port.send(&response).await;
        });

        let result = client
            .send_command(op::DISPENSE, b"0101", Duration::from_secs(1), true)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(
            result.error_code.unwrap().to_string(),
            "DEV.HCDM.COMMAND.TIMEOUT"
        );

        script.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_10k_enq_probe_then_ack() {
        let (client, mut port) = client(CdmVariant::Cdm10k).await;
        let request = cdm10k::build_frame(cdm10k::op::STATUS, b"").unwrap();
        let request_len = request.len();
        let response = cdm10k::build_frame(cdm10k::RSP_OK, b"").unwrap();

        let script = tokio::spawn(async move {
            port.recv_exact(request_len).await.unwrap();
            // Stay silent past the half-window; the host probes with ENQ
            let probe = port.recv_exact(1).await.unwrap();
            assert_eq!(probe.as_ref(), &[ENQ]);
            port.send(&[ACK]).await.unwrap();
            port.send(&response).await.unwrap();
            port.recv_exact(1).await.unwrap();
        });

        let result = client
            .send_command(cdm10k::op::STATUS, b"", Duration::from_secs(1), false)
            .await
            .unwrap();
        assert!(result.success);

        script.await.unwrap();
    }

    #[tokio::test]
    async fn test_10k_corrupt_response_ignored() {
        let (client, mut port) = client(CdmVariant::Cdm10k).await;
        let good = cdm10k::build_frame(cdm10k::RSP_OK, b"V1").unwrap();

        let script = tokio::spawn(async move {
            port.recv().await.unwrap();
            port.send(&[ACK]).await.unwrap();
            // The framer itself drops the corrupt candidate; only the good
            // frame ever reaches the client
            let mut corrupt = good.to_vec();
            let last = corrupt.len() - 1;
            corrupt[last] ^= 0x40;
            port.send(&corrupt).await.unwrap();
            port.send(&good).await.unwrap();
            port.recv_exact(1).await.unwrap();
        });

        let result = client
            .send_command(cdm10k::op::VERSION, b"", Duration::from_secs(1), false)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.data.unwrap().as_ref(), b"V1");

        script.await.unwrap();
    }
}
