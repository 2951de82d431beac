//! Checksum schemes for the three wire formats
//!
//! - XOR fold (CDM-10K): XOR of every covered byte
//! - CRC-16/IBM (CDM-20K): poly 0x1021, init 0xFFFF, no xorout
//! - SSI (scanner): 16-bit two's complement of the byte sum

use tracing::trace;

/// XOR fold over `bytes` (CDM-10K frames, LEN_LO..ETX inclusive).
pub fn xor(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Verify an XOR checksum.
pub fn verify_xor(bytes: &[u8], expected: u8) -> bool {
    xor(bytes) == expected
}

/// CRC-16/IBM over `bytes` (CDM-20K frames, STX..ETX inclusive).
///
/// Poly 0x1021, init 0xFFFF, no reflection, no xorout.
pub fn crc16_ibm(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &b in bytes {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    trace!(len = bytes.len(), crc = format!("0x{:04X}", crc), "crc16");
    crc
}

/// Verify a CRC-16/IBM checksum.
pub fn verify_crc16_ibm(bytes: &[u8], expected: u16) -> bool {
    crc16_ibm(bytes) == expected
}

/// SSI checksum over `bytes` (every frame byte before the checksum field).
///
/// 16-bit two's complement of the unsigned byte sum, mod 65536.
pub fn ssi(bytes: &[u8]) -> u16 {
    let sum = bytes
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(b as u16));
    0u16.wrapping_sub(sum)
}

/// Verify an SSI checksum.
pub fn verify_ssi(bytes: &[u8], expected: u16) -> bool {
    ssi(bytes) == expected
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_xor_known_value() {
        assert_eq!(xor(&[]), 0);
        assert_eq!(xor(&[0xFF]), 0xFF);
        assert_eq!(xor(&[0x0F, 0xF0]), 0xFF);
        assert_eq!(xor(&[0x01, 0x02, 0x03]), 0x00);
    }

    #[test]
    fn test_crc16_known_value() {
        // "123456789" with poly 0x1021 / init 0xFFFF / no xorout
        assert_eq!(crc16_ibm(b"123456789"), 0x29B1);
        assert_eq!(crc16_ibm(&[]), 0xFFFF);
    }

    #[test]
    fn test_ssi_known_value() {
        // Sum of all bytes plus the checksum must be 0 mod 65536
        let bytes = [0x04u8, 0xE9, 0x04, 0x00];
        let chk = ssi(&bytes);
        let total: u16 = bytes
            .iter()
            .fold(0u16, |acc, &b| acc.wrapping_add(b as u16))
            .wrapping_add(chk);
        assert_eq!(total, 0);
    }

    #[test]
    fn test_verify_rejects_corruption() {
        let data = [0x02u8, 0x44, 0x01, 0x03];
        assert!(verify_xor(&data, xor(&data)));
        assert!(!verify_xor(&data, xor(&data) ^ 0x01));
        assert!(verify_crc16_ibm(&data, crc16_ibm(&data)));
        assert!(!verify_crc16_ibm(&data, crc16_ibm(&data).wrapping_add(1)));
        assert!(verify_ssi(&data, ssi(&data)));
        assert!(!verify_ssi(&data, ssi(&data).wrapping_add(1)));
    }

    proptest! {
        #[test]
        fn prop_xor_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            prop_assert!(verify_xor(&data, xor(&data)));
        }

        #[test]
        fn prop_crc16_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            prop_assert!(verify_crc16_ibm(&data, crc16_ibm(&data)));
        }

        #[test]
        fn prop_ssi_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            prop_assert!(verify_ssi(&data, ssi(&data)));
        }

        #[test]
        fn prop_crc16_detects_single_bit_flip(
            data in proptest::collection::vec(any::<u8>(), 1..128),
            bit in 0usize..8,
            idx_seed in any::<usize>(),
        ) {
            let idx = idx_seed % data.len();
            let crc = crc16_ibm(&data);
            let mut corrupted = data.clone();
            corrupted[idx] ^= 1 << bit;
            prop_assert_ne!(crc16_ibm(&corrupted), crc);
        }
    }
}
