//! Register-bus frame integrity.
//!
//! Every write transaction carries a trailing CRC computed over the register
//! selector and the payload bytes; read responses carry the same CRC so the
//! host can detect corruption on its side. A mismatch on a write is a silent
//! no-op — the host retries.

use crc::{Algorithm, Crc};

/// CRC-8 used on the register bus: x^8 + x^5 + x^4 + 1, init 0, MSB first.
/// Fixed by the wire protocol; not one of the catalog algorithms.
pub const CRC_8_BUS: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0x31,
    init: 0x00,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0xa2,
    residue: 0x00,
};

pub const BUS_CRC: Crc<u8> = Crc::<u8>::new(&CRC_8_BUS);

/// CRC over the register selector followed by the payload bytes.
pub fn frame_crc(register: u8, payload: &[u8]) -> u8 {
    let mut digest = BUS_CRC.digest();
    digest.update(&[register]);
    digest.update(payload);
    digest.finalize()
}

/// Checks a complete received write transaction: `[selector][data...][crc]`.
pub fn verify_write_frame(frame: &[u8]) -> bool {
    let Some((&crc, body)) = frame.split_last() else {
        return false;
    };
    let Some((&register, payload)) = body.split_first() else {
        return false;
    };
    frame_crc(register, payload) == crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_reference_implementation() {
        // Reference value computed with the host daemon's bit-serial CRC.
        assert_eq!(frame_crc(0x31, &3900i16.to_le_bytes()), 0xb3);
    }

    #[test]
    fn round_trip() {
        for register in [0x01u8, 0x21, 0x31, 0x80] {
            for payload in [&[0x00u8][..], &[0x7f, 0xff][..], &[0xaa, 0x55][..]] {
                let crc = frame_crc(register, payload);
                let mut frame = [0u8; 4];
                frame[0] = register;
                frame[1..1 + payload.len()].copy_from_slice(payload);
                frame[1 + payload.len()] = crc;
                assert!(verify_write_frame(&frame[..payload.len() + 2]));
            }
        }
    }

    #[test]
    fn single_bit_flip_is_detected() {
        let payload = 3400u16.to_le_bytes();
        let crc = frame_crc(0x32, &payload);
        let frame = [0x32, payload[0], payload[1], crc];
        for byte in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame;
                corrupted[byte] ^= 1 << bit;
                assert!(
                    !verify_write_frame(&corrupted),
                    "flip of byte {byte} bit {bit} went undetected"
                );
            }
        }
    }

    #[test]
    fn truncated_frames_are_rejected() {
        assert!(!verify_write_frame(&[]));
        assert!(!verify_write_frame(&[0x21]));
    }
}
