//! CDM-10K cash dispenser wire format
//!
//! # Frame structure
//!
//! ```text
//! ┌──────┬────────┬────────┬─────┬─────────┬──────┬─────────┐
//! │ STX  │ LEN_LO │ LEN_HI │ CMD │ DATA…   │ ETX  │ XOR_CHK │
//! │ 0x02 │  LEN = 1 + len(DATA), LE u16    │ 0x03 │         │
//! └──────┴────────┴────────┴─────┴─────────┴──────┴─────────┘
//! ```
//!
//! XOR_CHK covers every byte from LEN_LO through ETX inclusive. The single
//! control bytes ACK (0x06) and NAK (0x15) are each a complete 1-byte frame.
//! A response CMD byte of `'O'` (0x4F) denotes success.

use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use periph_types::{ErrorCode, Severity, StatusEvent};

use crate::checksum;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::framer::Framer;
use crate::{ACK, ETX, MAX_FRAME_SIZE, NAK, STX};

/// Response CMD byte denoting success
pub const RSP_OK: u8 = b'O';

/// Bytes of frame overhead around CMD+DATA: STX, LEN_LO, LEN_HI, ETX, CHK
const OVERHEAD: usize = 5;

/// Largest DATA a frame may carry; bounded by [`MAX_FRAME_SIZE`] so every
/// built frame stays within what the framer will accept
pub const MAX_DATA: usize = MAX_FRAME_SIZE - OVERHEAD - 1;

/// Handshake window for the initial ACK
pub const ACK_WAIT: Duration = Duration::from_millis(300);

/// Retransmission cap on NAK or ACK-wait timeout
pub const MAX_NAK: usize = 3;

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

/// Build a complete CDM-10K frame for `cmd` + `data`.
pub fn build_frame(cmd: u8, data: &[u8]) -> Result<Bytes> {
    if data.len() > MAX_DATA {
        return Err(Error::PayloadTooLarge {
            size: data.len(),
            max: MAX_DATA,
        });
    }

    let len = (1 + data.len()) as u16;
    let mut buf = BytesMut::with_capacity(data.len() + OVERHEAD + 1);
    buf.put_u8(STX);
    buf.put_u16_le(len);
    buf.put_u8(cmd);
    buf.put_slice(data);
    buf.put_u8(ETX);
    // Checksum covers LEN_LO..ETX inclusive
    let chk = checksum::xor(&buf[1..]);
    buf.put_u8(chk);

    trace!(cmd = %(cmd as char), frame = hex::encode_upper(&buf), "built 10K frame");
    Ok(buf.freeze())
}

/// Verify frame structure and checksum of a complete multi-byte frame.
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
    let len = LittleEndian::read_u16(&frame[1..3]) as usize;
    if frame.len() != len + OVERHEAD {
        return Err(Error::MalformedFrame(format!(
            "length field {} does not match frame size {}",
            len,
            frame.len()
        )));
    }
    if frame[frame.len() - 2] != ETX {
        return Err(Error::MalformedFrame("missing ETX".into()));
    }
    let expected = checksum::xor(&frame[1..frame.len() - 1]);
    let received = frame[frame.len() - 1];
    if expected != received {
        return Err(Error::ChecksumMismatch {
            expected: expected as u16,
            received: received as u16,
        });
    }
    Ok(())
}

/// Decoded CMD + DATA of a verified frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub cmd: u8,
    pub data: Bytes,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.cmd == RSP_OK
    }
}

/// Decode a multi-byte frame into its CMD byte and DATA payload.
pub fn decode_response(frame: &Frame) -> Result<Response> {
    verify(frame.as_bytes())?;
    let bytes = frame.as_bytes();
    Ok(Response {
        cmd: bytes[3],
        data: Bytes::copy_from_slice(&bytes[4..bytes.len() - 2]),
    })
}

/// Stateless framer for the CDM-10K stream.
///
/// ACK and NAK pass through as 1-byte frames; any other byte that is not STX
/// where a frame is expected is discarded (resynchronization). Multi-byte
/// candidates are validated (length, ETX position, checksum) before being
/// emitted; invalid candidates drop their STX and resync.
#[derive(Debug, Default, Clone, Copy)]
pub struct Cdm10kFramer;

impl Framer for Cdm10kFramer {
    fn extract(&self, buf: &mut BytesMut) -> Option<Frame> {
        loop {
            match buf.first().copied() {
                None => return None,
                Some(ACK) | Some(NAK) => {
                    return Some(Frame::from_bytes(buf.split_to(1).freeze()));
                }
                Some(STX) => {
                    if buf.len() < 3 {
                        return None;
                    }
                    let len = LittleEndian::read_u16(&buf[1..3]) as usize;
                    let total = len + OVERHEAD;
                    if len == 0 || total > MAX_FRAME_SIZE {
                        // Implausible length, byte was noise
                        let _ = buf.split_to(1);
                        continue;
                    }
                    if buf.len() < total {
                        return None;
                    }
                    if buf[total - 2] != ETX
                        || checksum::xor(&buf[1..total - 1]) != buf[total - 1]
                    {
                        trace!(frame = hex::encode_upper(&buf[..total]), "rejected 10K candidate");
                        let _ = buf.split_to(1);
                        continue;
                    }
                    return Some(Frame::from_bytes(buf.split_to(total).freeze()));
                }
                Some(_) => {
                    let _ = buf.split_to(1);
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "cdm10k"
    }
}

/// Map a CDM-10K sensor response DATA block to alarms.
///
/// Polarity is not uniform: the mount bits report `1` when the cassette is
/// present, so `0` raises the alarm. Preserved bit-for-bit from the device
/// documentation.
///
/// ```text
/// offset 0, bits 0-3: cassette 1-4 mounted (0 = unmounted -> alarm)
/// offset 1, bits 0-3: cassette 1-4 near-end (1 = alarm)
/// offset 2: ASCII '1' = reject box open
/// offset 3: ASCII '1' = shutter open
/// ```
pub fn decode_sensors(data: &[u8]) -> Vec<StatusEvent> {
    let mut alarms = Vec::new();
    let family = "HCDM";

    if let Some(&mounts) = data.first() {
        for cassette in 0..4u8 {
            if mounts & (1 << cassette) == 0 {
                let code = format!("CST{}_UNMOUNTED", cassette + 1);
                alarms.push(
                    StatusEvent::new(
                        code.clone(),
                        format!("cassette {} unmounted", cassette + 1),
                        Severity::Error,
                    )
                    .with_error_code(ErrorCode::sensor(family, code)),
                );
            }
        }
    }
    if let Some(&near_end) = data.get(1) {
        for cassette in 0..4u8 {
            if near_end & (1 << cassette) != 0 {
                let code = format!("CST{}_NEAR_END", cassette + 1);
                alarms.push(
                    StatusEvent::new(
                        code.clone(),
                        format!("cassette {} near end", cassette + 1),
                        Severity::Warning,
                    )
                    .with_error_code(ErrorCode::sensor(family, code)),
                );
            }
        }
    }
    if data.get(2) == Some(&b'1') {
        alarms.push(
            StatusEvent::new("REJECT_BOX_OPEN", "reject box open", Severity::Warning)
                .with_error_code(ErrorCode::sensor(family, "REJECT_BOX_OPEN")),
        );
    }
    if data.get(3) == Some(&b'1') {
        alarms.push(
            StatusEvent::new("SHUTTER_OPEN", "shutter open", Severity::Error)
                .with_error_code(ErrorCode::sensor(family, "SHUTTER_OPEN")),
        );
    }

    alarms
}
