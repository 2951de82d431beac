//! SSI scanner client
//!
//! Commands are a single write followed by a CMD_ACK / CMD_NAK wait. Decode
//! frames arrive unsolicited at any time, so the client runs a permanent
//! listener task that publishes decode events to subscribers and answers
//! each one with a CMD_ACK addressed to the scanner's echoed SOURCE byte;
//! an unacknowledged decode frame risks being re-queued by the device.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use periph_core::ssi::{self, DecodeEvent, NakCause, Opcode};
use periph_transport::Channel;
use periph_types::{code, CommandResult, ErrorCode};

use crate::error::Result;

const DECODE_QUEUE_CAPACITY: usize = 16;

/// Client for one connected SSI scanner
pub struct SsiClient {
    channel: Channel,
    decode_tx: broadcast::Sender<DecodeEvent>,
}

impl SsiClient {
    /// Wrap a channel and spawn the unsolicited-frame listener.
    pub fn new(channel: Channel) -> Self {
        let (decode_tx, _) = broadcast::channel(DECODE_QUEUE_CAPACITY);
        tokio::spawn(decode_listener(channel.clone(), decode_tx.clone()));
        Self { channel, decode_tx }
    }

    /// Stream of barcode reads.
    pub fn subscribe_decodes(&self) -> broadcast::Receiver<DecodeEvent> {
        self.decode_tx.subscribe()
    }

    /// Send one command and await the scanner's CMD_ACK or CMD_NAK.
    pub async fn send_command(
        &self,
        opcode: Opcode,
        payload: &[u8],
        persist: bool,
        window: Duration,
    ) -> Result<CommandResult> {
        let frame = ssi::build_host_command(opcode, payload, persist)?;

        let is_reply = |f: &periph_core::Frame| {
            matches!(
                ssi::decode_message(f).map(|m| m.opcode),
                Ok(Opcode::CmdAck) | Ok(Opcode::CmdNak)
            )
        };

        let reply = match self.channel.send_and_wait(frame, is_reply, window).await {
            Ok(reply) => reply,
            Err(periph_transport::Error::Timeout(ms)) => {
                return Ok(CommandResult::fail(
                    format!("{} unanswered after {} ms", opcode.name(), ms),
                    ErrorCode::command_timeout("SSI"),
                    true,
                ));
            }
            Err(e) => return Err(e.into()),
        };

        let message = ssi::decode_message(&reply)?;
        match message.opcode {
            Opcode::CmdAck => Ok(CommandResult::ok(format!("{} acknowledged", opcode.name()))),
            Opcode::CmdNak => {
                let cause = NakCause::from_byte(*message.data.first().unwrap_or(&0));
                debug!(?cause, "scanner NAKed {}", opcode.name());
                Ok(CommandResult::fail(
                    cause.message(),
                    ErrorCode::new("SSI", code::category::COMMAND, code::reason::NAK),
                    cause == NakCause::Resend,
                ))
            }
            _ => unreachable!("predicate admits only ACK/NAK"),
        }
    }

    /// Set one scanner parameter, optionally persisted to non-volatile storage.
    pub async fn set_param(
        &self,
        group: u8,
        param: u8,
        value: u8,
        persist: bool,
        window: Duration,
    ) -> Result<CommandResult> {
        self.send_command(Opcode::ParamSend, &[group, param, value], persist, window)
            .await
    }
}

/// Permanent task answering and publishing unsolicited decode frames.
async fn decode_listener(channel: Channel, decode_tx: broadcast::Sender<DecodeEvent>) {
    let mut rx = channel.subscribe();
    loop {
        let frame = match rx.recv().await {
            Ok(frame) => frame,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "decode listener lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("decode listener stopping, channel closed");
                return;
            }
        };

        let message = match ssi::decode_message(&frame) {
            Ok(message) if message.opcode.is_decode() => message,
            Ok(_) => continue,
            Err(e) => {
                trace!(error = %e, "ignoring unparseable frame");
                continue;
            }
        };

        // ACK first; the device retransmits unacknowledged decodes
        if let Err(e) = channel.write(ssi::build_command_ack(message.source)).await {
            warn!(error = %e, "failed to ACK decode frame");
            return;
        }

        match ssi::decode_event(&message) {
            Ok(event) => {
                trace!(symbology = event.symbology, text = %event.text, "barcode decoded");
                let _ = decode_tx.send(event);
            }
            Err(e) => warn!(error = %e, "malformed decode payload"),
        }
    }
}
