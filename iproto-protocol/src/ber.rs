//! BER compressed unsigned integers.
//!
//! Each byte carries 7 value bits, most significant group first. Every byte
//! but the last has the continuation bit (0x80) set:
//!
//! ```text
//! 127     -> 7f
//! 128     -> 81 00
//! 16384   -> 81 80 00
//! 100000  -> 86 8d 20
//! ```
//!
//! Encoding always uses the minimum number of bytes. Decoding is strict: a
//! leading `0x80` byte adds nothing to the value and is rejected as
//! [`PackError::NonMinimal`].

use crate::error::PackError;
use bytes::{Buf, BufMut};

/// Longest BER encoding of a `u64` (ceil(64 / 7)).
pub const MAX_BER_LEN: usize = 10;

const CONTINUATION: u8 = 0x80;
const VALUE_MASK: u8 = 0x7f;

/// Returns the number of bytes `value` takes in BER form.
pub fn ber_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

/// Writes `value` in BER form.
pub fn put_ber(dst: &mut impl BufMut, value: u64) {
    let len = ber_len(value);
    for group in (1..len).rev() {
        dst.put_u8(((value >> (7 * group)) as u8 & VALUE_MASK) | CONTINUATION);
    }
    dst.put_u8(value as u8 & VALUE_MASK);
}

/// Reads a BER integer no larger than `max`.
///
/// `kind` names the destination type in overflow errors.
pub fn get_ber(src: &mut impl Buf, kind: &'static str, max: u64) -> Result<u64, PackError> {
    let mut value: u64 = 0;
    let mut read = 0usize;

    loop {
        if !src.has_remaining() {
            return Err(PackError::truncated(read + 1, read));
        }
        let byte = src.get_u8();
        if read == 0 && byte == CONTINUATION {
            return Err(PackError::NonMinimal);
        }
        read += 1;

        if value > max >> 7 {
            return Err(PackError::Overflow { kind });
        }
        value = (value << 7) | u64::from(byte & VALUE_MASK);
        if value > max {
            return Err(PackError::Overflow { kind });
        }

        if byte & CONTINUATION == 0 {
            return Ok(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encode(value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        put_ber(&mut out, value);
        out
    }

    fn decode(mut data: &[u8], max: u64) -> Result<u64, PackError> {
        get_ber(&mut data, "u64", max)
    }

    #[test]
    fn test_known_encodings() {
        assert_eq!(encode(0), [0x00]);
        assert_eq!(encode(5), [0x05]);
        assert_eq!(encode(127), [0x7f]);
        assert_eq!(encode(128), [0x81, 0x00]);
        assert_eq!(encode(16383), [0xff, 0x7f]);
        assert_eq!(encode(16384), [0x81, 0x80, 0x00]);
        assert_eq!(encode(100_000), [0x86, 0x8d, 0x20]);
    }

    #[test]
    fn test_boundary_roundtrip() {
        for value in [0u64, 127, 128, 16383, 16384, u32::MAX as u64, u64::MAX] {
            let bytes = encode(value);
            assert_eq!(bytes.len(), ber_len(value), "length of {}", value);
            assert_eq!(decode(&bytes, u64::MAX).unwrap(), value);
        }
    }

    #[test]
    fn test_minimal_lengths() {
        assert_eq!(ber_len(0), 1);
        assert_eq!(ber_len(127), 1);
        assert_eq!(ber_len(128), 2);
        assert_eq!(ber_len(16383), 2);
        assert_eq!(ber_len(16384), 3);
        assert_eq!(ber_len(u32::MAX as u64), 5);
        assert_eq!(ber_len(u64::MAX), MAX_BER_LEN);
    }

    #[test]
    fn test_non_minimal_rejected() {
        // 0x80 0x05 is a padded encoding of 5.
        assert_eq!(decode(&[0x80, 0x05], u64::MAX), Err(PackError::NonMinimal));
        assert_eq!(
            decode(&[0x80, 0x80, 0x00], u64::MAX),
            Err(PackError::NonMinimal)
        );
        // A zero group after the first byte is part of the value, not padding.
        assert_eq!(decode(&[0x81, 0x80, 0x00], u64::MAX), Ok(16384));
    }

    #[test]
    fn test_truncated() {
        assert!(matches!(
            decode(&[], u64::MAX),
            Err(PackError::Truncated { .. })
        ));
        assert!(matches!(
            decode(&[0x81, 0x80], u64::MAX),
            Err(PackError::Truncated {
                needed: 3,
                remaining: 2
            })
        ));
    }

    #[test]
    fn test_overflow() {
        let bytes = encode(u32::MAX as u64 + 1);
        assert_eq!(
            decode(&bytes, u32::MAX as u64),
            Err(PackError::Overflow { kind: "u64" })
        );

        // Eleven continuation groups cannot fit any u64.
        let mut long = vec![0xffu8; 10];
        long.push(0x7f);
        assert!(matches!(
            decode(&long, u64::MAX),
            Err(PackError::Overflow { .. })
        ));
    }

    #[test]
    fn test_stops_at_last_byte() {
        let mut data: &[u8] = &[0x81, 0x00, 0xaa];
        assert_eq!(get_ber(&mut data, "u32", u32::MAX as u64).unwrap(), 128);
        assert_eq!(data, &[0xaa]);
    }

    proptest! {
        #[test]
        fn prop_ber_u32_roundtrip(value in any::<u32>()) {
            let bytes = encode(value as u64);
            prop_assert_eq!(bytes.len(), ber_len(value as u64));
            prop_assert_eq!(decode(&bytes, u32::MAX as u64).unwrap(), value as u64);
        }

        #[test]
        fn prop_ber_u64_roundtrip(value in any::<u64>()) {
            let bytes = encode(value);
            prop_assert_eq!(decode(&bytes, u64::MAX).unwrap(), value);
        }
    }
}
