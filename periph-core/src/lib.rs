//! # periph-core
//!
//! Pure protocol layer for kiosk peripherals:
//! - Frame extraction from byte streams ([`Framer`])
//! - The three checksum schemes (XOR, CRC-16/IBM, SSI two's complement)
//! - Frame building and response decoding for the CDM-10K, CDM-20K and SSI
//!   wire formats, including sensor-bitfield-to-alarm tables
//!
//! Everything here is synchronous and allocation-light; transports and
//! request/response correlation live in `periph-transport`.

pub mod cdm10k;
pub mod cdm20k;
pub mod checksum;
pub mod error;
pub mod frame;
pub mod framer;
pub mod ssi;

pub use error::{Error, Result};
pub use frame::Frame;
pub use framer::Framer;

/// Start of text, opens every multi-byte CDM frame
pub const STX: u8 = 0x02;

/// End of text, closes the payload of every multi-byte CDM frame
pub const ETX: u8 = 0x03;

/// Positive handshake / receipt acknowledgement
pub const ACK: u8 = 0x06;

/// Negative handshake, request retransmission
pub const NAK: u8 = 0x15;

/// Still-working heartbeat (CDM-20K), ACK-probe (CDM-10K, host to device)
pub const ENQ: u8 = 0x05;

/// Upper bound on any frame accepted by a framer; a buffer growing past
/// this without completing a frame is treated as garbage and resynced.
pub const MAX_FRAME_SIZE: usize = 4096;
