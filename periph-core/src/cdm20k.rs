//! CDM-20K cash dispenser wire format
//!
//! # Frame structure
//!
//! ```text
//! ┌──────┬─────┬─────────┬──────┬────────┬────────┐
//! │ STX  │ CMD │ DATA…   │ ETX  │ CRC_HI │ CRC_LO │
//! │ 0x02 │     │         │ 0x03 │  CRC-16/IBM     │
//! └──────┴─────┴─────────┴──────┴────────┴────────┘
//! ```
//!
//! There is no length field; the frame ends at the first ETX found past the
//! minimum message prefix, followed by a big-endian CRC over STX..ETX
//! inclusive. ACK (0x06), NAK (0x15) and ENQ (0x05) are 1-byte frames; the
//! device sends ENQ while a long command is still in progress.
//!
//! Response DATA opens with a 2-digit ASCII status, `"00"` meaning success.

use std::time::Duration;

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use periph_types::{ErrorCode, Severity, StatusEvent};

use crate::checksum;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::framer::Framer;
use crate::{ACK, ENQ, ETX, MAX_FRAME_SIZE, NAK, STX};

/// ASCII status that denotes success
pub const STATUS_OK: &str = "00";

/// Earliest byte index at which ETX terminates a message frame
const ETX_SCAN_FROM: usize = 3;

/// Bytes of frame overhead around CMD+DATA: STX, ETX, CRC_HI, CRC_LO
const OVERHEAD: usize = 4;

/// Handshake window for the initial ACK
pub const ACK_WAIT: Duration = Duration::from_millis(500);

/// Retransmission cap on NAK or ACK-wait timeout
pub const MAX_NAK: usize = 1;

/// Response deadline extension granted per received ENQ
pub const ENQ_EXTENSION: Duration = Duration::from_secs(3);

/// Command bytes
pub mod op {
    pub const INIT: u8 = b'I';
    pub const STATUS: u8 = b'S';
    pub const SENSOR: u8 = b'N';
    pub const DISPENSE: u8 = b'D';
    pub const PURGE: u8 = b'P';
    pub const VERSION: u8 = b'V';
    pub const RESET: u8 = b'R';
}

/// Build a complete CDM-20K frame for `cmd` + `data`.
pub fn build_frame(cmd: u8, data: &[u8]) -> Result<Bytes> {
    let total = data.len() + OVERHEAD + 1;
    if total > MAX_FRAME_SIZE {
        return Err(Error::PayloadTooLarge {
            size: data.len(),
            max: MAX_FRAME_SIZE - OVERHEAD - 1,
        });
    }

    let mut buf = BytesMut::with_capacity(total);
    buf.put_u8(STX);
    buf.put_u8(cmd);
    buf.put_slice(data);
    buf.put_u8(ETX);
    let crc = checksum::crc16_ibm(&buf);
    buf.put_u16(crc);

    trace!(cmd = %(cmd as char), frame = hex::encode_upper(&buf), "built 20K frame");
    Ok(buf.freeze())
}

/// Verify frame structure and CRC of a complete multi-byte frame.
pub fn verify(frame: &[u8]) -> Result<()> {
    if frame.len() < OVERHEAD + 1 {
        return Err(Error::FrameTooShort {
            expected: OVERHEAD + 1,
            actual: frame.len(),
        });
    }
    if frame[0] != STX {
        return Err(Error::MalformedFrame("missing STX".into()));
    }
    if frame[frame.len() - 3] != ETX {
        return Err(Error::MalformedFrame("missing ETX".into()));
    }
    let expected = checksum::crc16_ibm(&frame[..frame.len() - 2]);
    let received = BigEndian::read_u16(&frame[frame.len() - 2..]);
    if expected != received {
        return Err(Error::ChecksumMismatch { expected, received });
    }
    Ok(())
}

/// Decoded CMD, ASCII status and payload of a verified frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub cmd: u8,
    pub status: String,
    pub data: Bytes,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// Decode a multi-byte frame into CMD, the 2-digit status and the payload.
pub fn decode_response(frame: &Frame) -> Result<Response> {
    verify(frame.as_bytes())?;
    let bytes = frame.as_bytes();
    let body = &bytes[2..bytes.len() - 3];
    if body.len() < 2 {
        return Err(Error::MalformedFrame(format!(
            "response body too short for status digits: {} byte(s)",
            body.len()
        )));
    }
    let status = String::from_utf8_lossy(&body[..2]).into_owned();
    Ok(Response {
        cmd: bytes[1],
        status,
        data: Bytes::copy_from_slice(&body[2..]),
    })
}

/// Stateless framer for the CDM-20K stream.
///
/// Message frames end at the first ETX found at index >= 3; the two CRC
/// bytes that follow are carried along unverified. The client re-verifies
/// the CRC and keeps waiting on a mismatch, so a corrupt frame never stalls
/// the stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct Cdm20kFramer;

impl Framer for Cdm20kFramer {
    fn extract(&self, buf: &mut BytesMut) -> Option<Frame> {
        loop {
            match buf.first().copied() {
                None => return None,
                Some(ACK) | Some(NAK) | Some(ENQ) => {
                    return Some(Frame::from_bytes(buf.split_to(1).freeze()));
                }
                Some(STX) => {
                    match buf[ETX_SCAN_FROM.min(buf.len())..]
                        .iter()
                        .position(|&b| b == ETX)
                    {
                        Some(offset) => {
                            let total = ETX_SCAN_FROM + offset + 3;
                            if buf.len() < total {
                                return None;
                            }
                            return Some(Frame::from_bytes(buf.split_to(total).freeze()));
                        }
                        None => {
                            if buf.len() > MAX_FRAME_SIZE {
                                // Runaway accumulation, the STX was noise
                                trace!(len = buf.len(), "no ETX within frame limit, resyncing");
                                let _ = buf.split_to(1);
                                continue;
                            }
                            return None;
                        }
                    }
                }
                Some(_) => {
                    let _ = buf.split_to(1);
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "cdm20k"
    }
}

bitflags! {
    /// One bit per cassette, offsets used by the paper-low and skew bytes.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct CassetteBits: u8 {
        const CST1 = 1 << 0;
        const CST2 = 1 << 1;
        const CST3 = 1 << 2;
        const CST4 = 1 << 3;
        const CST5 = 1 << 4;
        const CST6 = 1 << 5;
    }
}

const ASCII_FLAGS: &[(usize, &str, &str)] = &[
    (6, "GATE1", "gate 1 sensor blocked"),
    (7, "GATE2", "gate 2 sensor blocked"),
    (9, "EXIT1", "exit sensor blocked"),
    (10, "REJECT_IN", "note present in reject path"),
    (11, "REJECT_BOX_OPEN", "reject box open"),
    (12, "CIS_OPEN", "CIS unit open"),
];

fn cassette_alarms(
    byte: u8,
    code: impl Fn(u8) -> String,
    message: impl Fn(u8) -> String,
    severity: Severity,
    alarms: &mut Vec<StatusEvent>,
) {
    for bits in CassetteBits::from_bits_truncate(byte).iter() {
        let cassette = bits.bits().trailing_zeros() as u8 + 1;
        let code = code(cassette);
        alarms.push(
            StatusEvent::new(code.clone(), message(cassette), severity)
                .with_error_code(ErrorCode::sensor("HCDM", code)),
        );
    }
}

/// Map a CDM-20K sensor payload (the DATA after the status digits) to alarms.
///
/// ```text
/// offset 0, bits 0-5: cassette 1-6 paper low
/// offset 3, bits 0-5: cassette 1-6 skew sensor 1
/// offset 4, bits 0-5: cassette 1-6 skew sensor 2
/// offsets 6,7,9,10,11,12: ASCII '1' flags
///   GATE1, GATE2, EXIT1, REJECT_IN, REJECT_BOX_OPEN, CIS_OPEN
/// ```
///
/// Alarm order is fixed: paper-low by cassette, SKEW1 by cassette, SKEW2 by
/// cassette, then the ASCII flags in offset order. A payload shorter than an
/// offset simply reports no alarm for it.
pub fn decode_sensors(data: &[u8]) -> Vec<StatusEvent> {
    let mut alarms = Vec::new();

    if let Some(&low) = data.first() {
        cassette_alarms(
            low,
            |c| format!("CST{c}_LOW"),
            |c| format!("cassette {c} paper low"),
            Severity::Warning,
            &mut alarms,
        );
    }
    if let Some(&skew1) = data.get(3) {
        cassette_alarms(
            skew1,
            |c| format!("CST{c}_SKEW1"),
            |c| format!("cassette {c} skew sensor 1"),
            Severity::Error,
            &mut alarms,
        );
    }
    if let Some(&skew2) = data.get(4) {
        cassette_alarms(
            skew2,
            |c| format!("CST{c}_SKEW2"),
            |c| format!("cassette {c} skew sensor 2"),
            Severity::Error,
            &mut alarms,
        );
    }
    for &(offset, code, message) in ASCII_FLAGS {
        if data.get(offset) == Some(&b'1') {
            alarms.push(
                StatusEvent::new(code, message, Severity::Error)
                    .with_error_code(ErrorCode::sensor("HCDM", code)),
            );
        }
    }

    alarms
}
