//! SSI scanner wire format
//!
//! # Frame structure
//!
//! ```text
//! standard:  LEN  OPCODE SOURCE STATUS DATA… CHK_HI CHK_LO
//! extended:  0xFF LEN2_HI LEN2_LO OPCODE SOURCE STATUS DATA… CHK_HI CHK_LO
//! ```
//!
//! LEN (and big-endian LEN2) count the total frame size in bytes, the
//! length prefix and the 2-byte checksum included. Standard LEN is capped at
//! 0xFE so the 0xFF marker unambiguously selects extended framing. The
//! checksum is the 16-bit two's complement of the sum of every byte that
//! precedes it, big-endian on the wire.
//!
//! Decode frames (1D and 2D) arrive unsolicited and must be answered with a
//! CMD_ACK addressed to the SOURCE byte echoed from the frame.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::checksum;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::framer::Framer;
use crate::MAX_FRAME_SIZE;

/// Marker byte selecting the extended (16-bit length) framing
pub const EXT_MARKER: u8 = 0xFF;

/// Largest standard-frame LEN value
pub const MAX_STD_LEN: usize = 0xFE;

/// SOURCE byte identifying the host
pub const SOURCE_HOST: u8 = 0x04;

/// STATUS bit requesting persistence to non-volatile storage
pub const STATUS_PERSIST: u8 = 0x08;

/// Standard-frame overhead: LEN, OPCODE, SOURCE, STATUS, CHK_HI, CHK_LO
const STD_OVERHEAD: usize = 6;

/// Extended-frame overhead: marker, LEN2 (2), OPCODE, SOURCE, STATUS, checksum
const EXT_OVERHEAD: usize = 8;

/// SSI operation codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    RequestRevision = 0xA3,
    ParamSend = 0xC6,
    CmdAck = 0xD0,
    CmdNak = 0xD1,
    StartDecode = 0xE4,
    StopDecode = 0xE5,
    ScanEnable = 0xE9,
    ScanDisable = 0xEA,
    DecodeData = 0xF3,
    DecodeData2d = 0xF4,
    Reset = 0xFA,
}

impl Opcode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestRevision => "REQUEST_REVISION",
            Self::ParamSend => "PARAM_SEND",
            Self::CmdAck => "CMD_ACK",
            Self::CmdNak => "CMD_NAK",
            Self::StartDecode => "START_DECODE",
            Self::StopDecode => "STOP_DECODE",
            Self::ScanEnable => "SCAN_ENABLE",
            Self::ScanDisable => "SCAN_DISABLE",
            Self::DecodeData => "DECODE_DATA",
            Self::DecodeData2d => "DECODE_DATA_2D",
            Self::Reset => "RESET",
        }
    }

    /// True for the unsolicited 1D/2D decode data opcodes.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::DecodeData | Self::DecodeData2d)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0xA3 => Ok(Self::RequestRevision),
            0xC6 => Ok(Self::ParamSend),
            0xD0 => Ok(Self::CmdAck),
            0xD1 => Ok(Self::CmdNak),
            0xE4 => Ok(Self::StartDecode),
            0xE5 => Ok(Self::StopDecode),
            0xE9 => Ok(Self::ScanEnable),
            0xEA => Ok(Self::ScanDisable),
            0xF3 => Ok(Self::DecodeData),
            0xF4 => Ok(Self::DecodeData2d),
            0xFA => Ok(Self::Reset),
            other => Err(Error::UnknownOpcode(other)),
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), *self as u8)
    }
}

/// Cause byte of a CMD_NAK frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NakCause {
    /// 0x01, last frame should be retransmitted
    Resend,
    /// 0x02, command not allowed in the current state
    BadContext,
    /// 0x06, command understood but refused
    Denied,
    Other(u8),
}

impl NakCause {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => Self::Resend,
            0x02 => Self::BadContext,
            0x06 => Self::Denied,
            other => Self::Other(other),
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Resend => "scanner requested retransmission".into(),
            Self::BadContext => "command not valid in current scanner state".into(),
            Self::Denied => "command denied by scanner".into(),
            Self::Other(b) => format!("scanner NAK with cause 0x{b:02X}"),
        }
    }
}

/// Build an SSI frame, choosing standard or extended framing by size.
pub fn build_frame(opcode: Opcode, source: u8, status: u8, data: &[u8]) -> Result<Bytes> {
    let std_total = data.len() + STD_OVERHEAD;
    if std_total <= MAX_STD_LEN {
        let mut buf = BytesMut::with_capacity(std_total);
        buf.put_u8(std_total as u8);
        buf.put_u8(opcode as u8);
        buf.put_u8(source);
        buf.put_u8(status);
        buf.put_slice(data);
        let chk = checksum::ssi(&buf);
        buf.put_u16(chk);
        trace!(%opcode, frame = hex::encode_upper(&buf), "built SSI frame");
        return Ok(buf.freeze());
    }

    let ext_total = data.len() + EXT_OVERHEAD;
    if ext_total > MAX_FRAME_SIZE {
        return Err(Error::PayloadTooLarge {
            size: data.len(),
            max: MAX_FRAME_SIZE - EXT_OVERHEAD,
        });
    }
    let mut buf = BytesMut::with_capacity(ext_total);
    buf.put_u8(EXT_MARKER);
    buf.put_u16(ext_total as u16);
    buf.put_u8(opcode as u8);
    buf.put_u8(source);
    buf.put_u8(status);
    buf.put_slice(data);
    let chk = checksum::ssi(&buf);
    buf.put_u16(chk);
    trace!(%opcode, frame = hex::encode_upper(&buf), "built extended SSI frame");
    Ok(buf.freeze())
}

/// Build a host command frame, SOURCE fixed to the host identifier.
pub fn build_host_command(opcode: Opcode, data: &[u8], persist: bool) -> Result<Bytes> {
    let status = if persist { STATUS_PERSIST } else { 0x00 };
    build_frame(opcode, SOURCE_HOST, status, data)
}

/// Build the CMD_ACK reply for an unsolicited frame, echoing its SOURCE.
pub fn build_command_ack(source: u8) -> Bytes {
    // STD_OVERHEAD bytes always fit the standard form
    build_frame(Opcode::CmdAck, source, 0x00, &[]).expect("empty CMD_ACK always fits")
}

/// Verify frame structure and checksum of a complete frame.
pub fn verify(frame: &[u8]) -> Result<()> {
    let (declared, min) = if frame.first() == Some(&EXT_MARKER) {
        if frame.len() < EXT_OVERHEAD {
            return Err(Error::FrameTooShort {
                expected: EXT_OVERHEAD,
                actual: frame.len(),
            });
        }
        (BigEndian::read_u16(&frame[1..3]) as usize, EXT_OVERHEAD)
    } else {
        if frame.len() < STD_OVERHEAD {
            return Err(Error::FrameTooShort {
                expected: STD_OVERHEAD,
                actual: frame.len(),
            });
        }
        (frame[0] as usize, STD_OVERHEAD)
    };

    if declared < min || declared != frame.len() {
        return Err(Error::MalformedFrame(format!(
            "length field {} does not match frame size {}",
            declared,
            frame.len()
        )));
    }
    let expected = checksum::ssi(&frame[..frame.len() - 2]);
    let received = BigEndian::read_u16(&frame[frame.len() - 2..]);
    if expected != received {
        return Err(Error::ChecksumMismatch { expected, received });
    }
    Ok(())
}

/// Parsed OPCODE, SOURCE, STATUS and payload of a verified frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsiMessage {
    pub opcode: Opcode,
    pub source: u8,
    pub status: u8,
    pub data: Bytes,
}

/// Decode a frame into its message fields, verifying the checksum.
pub fn decode_message(frame: &Frame) -> Result<SsiMessage> {
    verify(frame.as_bytes())?;
    let bytes = frame.as_bytes();
    let header = if bytes[0] == EXT_MARKER { 3 } else { 1 };
    Ok(SsiMessage {
        opcode: Opcode::try_from(bytes[header])?,
        source: bytes[header + 1],
        status: bytes[header + 2],
        data: Bytes::copy_from_slice(&bytes[header + 3..bytes.len() - 2]),
    })
}

/// One successful barcode read, published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeEvent {
    /// Symbology identifier reported by the scanner
    pub symbology: u8,
    /// Decoded barcode text, lossily converted from the raw bytes
    pub text: String,
}

/// Extract the barcode payload of a DECODE_DATA / DECODE_DATA_2D message.
pub fn decode_event(message: &SsiMessage) -> Result<DecodeEvent> {
    if !message.opcode.is_decode() {
        return Err(Error::MalformedFrame(format!(
            "{} is not a decode opcode",
            message.opcode
        )));
    }
    let Some((&symbology, text)) = message.data.split_first() else {
        return Err(Error::MalformedFrame("decode frame without payload".into()));
    };
    Ok(DecodeEvent {
        symbology,
        text: String::from_utf8_lossy(text).into_owned(),
    })
}

/// Stateless framer for the SSI stream.
///
/// Length-prefixed, so framing is a plausibility check on the declared
/// length followed by a checksum check once the frame is complete. A byte
/// that fails either is discarded and scanning resumes one byte later.
#[derive(Debug, Default, Clone, Copy)]
pub struct SsiFramer;

impl Framer for SsiFramer {
    fn extract(&self, buf: &mut BytesMut) -> Option<Frame> {
        loop {
            let first = *buf.first()?;
            let (total, min) = if first == EXT_MARKER {
                if buf.len() < 3 {
                    return None;
                }
                (BigEndian::read_u16(&buf[1..3]) as usize, EXT_OVERHEAD)
            } else {
                (first as usize, STD_OVERHEAD)
            };

            if total < min || total > MAX_FRAME_SIZE {
                let _ = buf.split_to(1);
                continue;
            }
            if buf.len() < total {
                return None;
            }
            let expected = checksum::ssi(&buf[..total - 2]);
            let received = BigEndian::read_u16(&buf[total - 2..total]);
            if expected != received {
                trace!(frame = hex::encode_upper(&buf[..total]), "rejected SSI candidate");
                let _ = buf.split_to(1);
                continue;
            }
            return Some(Frame::from_bytes(buf.split_to(total).freeze()));
        }
    }

    fn name(&self) -> &'static str {
        "ssi"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::testing::feed_chunked;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_build_standard_frame() {
        let frame = build_host_command(Opcode::ScanEnable, &[], false).unwrap();
        assert_eq!(frame.len(), 6);
        assert_eq!(&frame[..4], &[0x06, 0xE9, SOURCE_HOST, 0x00]);
        assert!(verify(&frame).is_ok());
    }

    #[test]
    fn test_build_param_send_persist() {
        let frame = build_host_command(Opcode::ParamSend, &[0x01, 0x8A, 0x02], true).unwrap();
        assert_eq!(frame[0], 0x09);
        assert_eq!(frame[3], STATUS_PERSIST);
        assert_eq!(&frame[4..7], &[0x01, 0x8A, 0x02]);
        assert!(verify(&frame).is_ok());
    }

    #[test]
    fn test_build_extended_above_standard_cap() {
        let data = vec![0x41u8; 300];
        let frame = build_frame(Opcode::DecodeData, 0x00, 0x00, &data).unwrap();
        assert_eq!(frame[0], EXT_MARKER);
        assert_eq!(
            u16::from_be_bytes([frame[1], frame[2]]) as usize,
            frame.len()
        );
        assert!(verify(&frame).is_ok());
    }

    #[test]
    fn test_decode_extended_2d_scenario() {
        let bytes = [
            0xFF, 0x00, 0x0B, 0xF4, 0x00, 0x00, 0x01, b'A', b'B', 0xFD, 0x7E,
        ];
        let mut buf = BytesMut::from(&bytes[..]);
        let frame = SsiFramer.extract(&mut buf).unwrap();
        let message = decode_message(&frame).unwrap();
        assert_eq!(message.opcode, Opcode::DecodeData2d);
        assert_eq!(message.source, 0x00);

        let event = decode_event(&message).unwrap();
        assert_eq!(event.symbology, 0x01);
        assert_eq!(event.text, "AB");
    }

    #[test]
    fn test_command_ack_echoes_source() {
        let ack = build_command_ack(0x2A);
        let message = decode_message(&Frame::from_bytes(ack)).unwrap();
        assert_eq!(message.opcode, Opcode::CmdAck);
        assert_eq!(message.source, 0x2A);
    }

    #[test]
    fn test_nak_causes_distinct() {
        assert_eq!(NakCause::from_byte(0x01), NakCause::Resend);
        assert_eq!(NakCause::from_byte(0x02), NakCause::BadContext);
        assert_eq!(NakCause::from_byte(0x06), NakCause::Denied);
        assert_eq!(NakCause::from_byte(0x7F), NakCause::Other(0x7F));

        let messages: Vec<String> = [0x01, 0x02, 0x06]
            .iter()
            .map(|&b| NakCause::from_byte(b).message())
            .collect();
        assert_ne!(messages[0], messages[1]);
        assert_ne!(messages[1], messages[2]);
    }

    #[test]
    fn test_framer_rejects_bad_checksum() {
        // Plausible length, zeroed body, wrong checksum; every byte of the
        // candidate is discarded before the genuine frame behind it
        let mut bytes = vec![0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        let good = build_host_command(Opcode::StartDecode, &[], false).unwrap();
        bytes.extend_from_slice(&good);

        let mut buf = BytesMut::from(&bytes[..]);
        let frame = SsiFramer.extract(&mut buf).unwrap();
        assert_eq!(frame.as_bytes(), &good[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_framer_discards_noise() {
        let good = build_host_command(Opcode::Reset, &[], false).unwrap();
        let mut bytes = vec![0x00, 0x01, 0x02];
        bytes.extend_from_slice(&good);
        let mut buf = BytesMut::from(&bytes[..]);
        let frame = SsiFramer.extract(&mut buf).unwrap();
        assert_eq!(frame.as_bytes(), &good[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unknown_opcode() {
        let frame = build_frame(Opcode::CmdAck, 0x00, 0x00, &[]).unwrap();
        let mut bytes = frame.to_vec();
        bytes[1] = 0x99;
        let total = bytes.len();
        let chk = checksum::ssi(&bytes[..total - 2]);
        bytes[total - 2..].copy_from_slice(&chk.to_be_bytes());

        let err = decode_message(&Frame::from_bytes(bytes)).unwrap_err();
        assert!(matches!(err, Error::UnknownOpcode(0x99)));
    }

    proptest! {
        #[test]
        fn prop_framer_fragmentation(
            data in proptest::collection::vec(any::<u8>(), 0..512),
            chunk in 1usize..16,
        ) {
            let frame = build_frame(Opcode::DecodeData, 0x00, 0x00, &data).unwrap();
            let whole = feed_chunked(&SsiFramer, &frame, frame.len());
            let split = feed_chunked(&SsiFramer, &frame, chunk);
            prop_assert_eq!(whole, split);
        }

        #[test]
        fn prop_build_verify(
            data in proptest::collection::vec(any::<u8>(), 0..1024),
            source in any::<u8>(),
            status in any::<u8>(),
        ) {
            let frame = build_frame(Opcode::ParamSend, source, status, &data).unwrap();
            prop_assert!(verify(&frame).is_ok());
        }
    }
}
