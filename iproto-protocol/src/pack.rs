//! Binary packing of primitive values.
//!
//! Every packer takes a [`Mode`] from its call site: the same value can be
//! written fixed-width or BER-compressed depending on where it appears.
//!
//! | Type                     | `Mode::Default`              | `Mode::Ber`              |
//! |--------------------------|------------------------------|--------------------------|
//! | `u8`, `i8`, `bool`       | 1 byte                       | 1 byte                   |
//! | `u16`/`u32`/`u64`        | 2/4/8 bytes little-endian    | BER                      |
//! | `i16`/`i32`/`i64`        | as the unsigned bit pattern  | BER of the bit pattern   |
//! | `str`, `String`, `Bytes` | u32 LE length + raw bytes    | BER length + raw bytes   |
//! | `Vec<T>`, `[T]`          | u32 LE length + elements     | BER length + elements    |

use crate::ber::{get_ber, put_ber};
use crate::error::PackError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Integer encoding selected at the call site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Fixed-width little-endian.
    #[default]
    Default,
    /// BER variable-length.
    Ber,
}

/// A value that can be written in wire form.
pub trait Pack {
    fn pack<B: BufMut>(&self, dst: &mut B, mode: Mode) -> Result<(), PackError>;
}

/// A value that can be read back from wire form.
///
/// Implementations never read past the end of `src`; short input is a
/// [`PackError::Truncated`].
pub trait Unpack: Sized {
    /// Fewest bytes one value occupies on the wire.
    const MIN_WIRE_LEN: usize = 1;

    fn unpack<B: Buf>(src: &mut B, mode: Mode) -> Result<Self, PackError>;
}

/// Packs `value` into a fresh buffer.
pub fn pack<T: Pack + ?Sized>(value: &T, mode: Mode) -> Result<Bytes, PackError> {
    let mut buf = BytesMut::new();
    value.pack(&mut buf, mode)?;
    Ok(buf.freeze())
}

/// Unpacks a `T` from the front of `data`, returning it with the number of
/// bytes consumed.
pub fn unpack<T: Unpack>(data: &[u8], mode: Mode) -> Result<(T, usize), PackError> {
    let mut src = data;
    let value = T::unpack(&mut src, mode)?;
    Ok((value, data.len() - src.len()))
}

/// Unpacks into an existing destination. `dest` is left untouched on error.
pub fn unpack_into<T: Unpack>(data: &[u8], dest: &mut T, mode: Mode) -> Result<usize, PackError> {
    let (value, consumed) = unpack(data, mode)?;
    *dest = value;
    Ok(consumed)
}

fn ensure(src: &impl Buf, needed: usize) -> Result<(), PackError> {
    if src.remaining() < needed {
        return Err(PackError::truncated(needed, src.remaining()));
    }
    Ok(())
}

fn pack_len<B: BufMut>(len: usize, dst: &mut B, mode: Mode) -> Result<(), PackError> {
    let len = u32::try_from(len).map_err(|_| PackError::Overflow {
        kind: "u32 length prefix",
    })?;
    len.pack(dst, mode)
}

/// Reads a length prefix and checks that at least `len * min_item` bytes
/// follow.
fn unpack_len<B: Buf>(src: &mut B, mode: Mode, min_item: usize) -> Result<usize, PackError> {
    let len = u32::unpack(src, mode)? as usize;
    ensure(src, len.saturating_mul(min_item))?;
    Ok(len)
}

impl Pack for u8 {
    fn pack<B: BufMut>(&self, dst: &mut B, _mode: Mode) -> Result<(), PackError> {
        dst.put_u8(*self);
        Ok(())
    }
}

impl Unpack for u8 {
    fn unpack<B: Buf>(src: &mut B, _mode: Mode) -> Result<Self, PackError> {
        ensure(src, 1)?;
        Ok(src.get_u8())
    }
}

impl Pack for i8 {
    fn pack<B: BufMut>(&self, dst: &mut B, _mode: Mode) -> Result<(), PackError> {
        dst.put_i8(*self);
        Ok(())
    }
}

impl Unpack for i8 {
    fn unpack<B: Buf>(src: &mut B, _mode: Mode) -> Result<Self, PackError> {
        ensure(src, 1)?;
        Ok(src.get_i8())
    }
}

impl Pack for bool {
    fn pack<B: BufMut>(&self, dst: &mut B, _mode: Mode) -> Result<(), PackError> {
        dst.put_u8(u8::from(*self));
        Ok(())
    }
}

impl Unpack for bool {
    fn unpack<B: Buf>(src: &mut B, _mode: Mode) -> Result<Self, PackError> {
        ensure(src, 1)?;
        match src.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(PackError::Unsupported(format!(
                "bool byte {:#04x}",
                other
            ))),
        }
    }
}

macro_rules! impl_unsigned {
    ($($ty:ty => $put:ident, $get:ident;)*) => {$(
        impl Pack for $ty {
            fn pack<B: BufMut>(&self, dst: &mut B, mode: Mode) -> Result<(), PackError> {
                match mode {
                    Mode::Default => dst.$put(*self),
                    Mode::Ber => put_ber(dst, u64::from(*self)),
                }
                Ok(())
            }
        }

        impl Unpack for $ty {
            fn unpack<B: Buf>(src: &mut B, mode: Mode) -> Result<Self, PackError> {
                match mode {
                    Mode::Default => {
                        ensure(src, std::mem::size_of::<$ty>())?;
                        Ok(src.$get())
                    }
                    Mode::Ber => {
                        let value = get_ber(src, stringify!($ty), u64::from(<$ty>::MAX))?;
                        Ok(value as $ty)
                    }
                }
            }
        }
    )*};
}

impl_unsigned! {
    u16 => put_u16_le, get_u16_le;
    u32 => put_u32_le, get_u32_le;
    u64 => put_u64_le, get_u64_le;
}

macro_rules! impl_signed {
    ($($ty:ty as $unsigned:ty;)*) => {$(
        impl Pack for $ty {
            fn pack<B: BufMut>(&self, dst: &mut B, mode: Mode) -> Result<(), PackError> {
                (*self as $unsigned).pack(dst, mode)
            }
        }

        impl Unpack for $ty {
            fn unpack<B: Buf>(src: &mut B, mode: Mode) -> Result<Self, PackError> {
                Ok(<$unsigned>::unpack(src, mode)? as $ty)
            }
        }
    )*};
}

impl_signed! {
    i16 as u16;
    i32 as u32;
    i64 as u64;
}

impl Pack for str {
    fn pack<B: BufMut>(&self, dst: &mut B, mode: Mode) -> Result<(), PackError> {
        pack_len(self.len(), dst, mode)?;
        dst.put_slice(self.as_bytes());
        Ok(())
    }
}

impl Pack for String {
    fn pack<B: BufMut>(&self, dst: &mut B, mode: Mode) -> Result<(), PackError> {
        self.as_str().pack(dst, mode)
    }
}

impl Unpack for String {
    fn unpack<B: Buf>(src: &mut B, mode: Mode) -> Result<Self, PackError> {
        let len = unpack_len(src, mode, 1)?;
        let mut raw = vec![0u8; len];
        src.copy_to_slice(&mut raw);
        String::from_utf8(raw).map_err(|_| PackError::InvalidUtf8)
    }
}

impl Pack for Bytes {
    fn pack<B: BufMut>(&self, dst: &mut B, mode: Mode) -> Result<(), PackError> {
        pack_len(self.len(), dst, mode)?;
        dst.put_slice(self);
        Ok(())
    }
}

impl Unpack for Bytes {
    fn unpack<B: Buf>(src: &mut B, mode: Mode) -> Result<Self, PackError> {
        let len = unpack_len(src, mode, 1)?;
        Ok(src.copy_to_bytes(len))
    }
}

impl<T: Pack> Pack for [T] {
    fn pack<B: BufMut>(&self, dst: &mut B, mode: Mode) -> Result<(), PackError> {
        pack_len(self.len(), dst, mode)?;
        for item in self {
            item.pack(dst, mode)?;
        }
        Ok(())
    }
}

impl<T: Pack> Pack for Vec<T> {
    fn pack<B: BufMut>(&self, dst: &mut B, mode: Mode) -> Result<(), PackError> {
        self.as_slice().pack(dst, mode)
    }
}

impl<T: Unpack> Unpack for Vec<T> {
    fn unpack<B: Buf>(src: &mut B, mode: Mode) -> Result<Self, PackError> {
        let len = unpack_len(src, mode, T::MIN_WIRE_LEN)?;
        let mut items = Vec::with_capacity(len.min(src.remaining()));
        for _ in 0..len {
            items.push(T::unpack(src, mode)?);
        }
        Ok(items)
    }
}

impl<T: Pack + ?Sized> Pack for &T {
    fn pack<B: BufMut>(&self, dst: &mut B, mode: Mode) -> Result<(), PackError> {
        (**self).pack(dst, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip<T: Pack + Unpack + PartialEq + std::fmt::Debug>(value: T, mode: Mode) {
        let bytes = pack(&value, mode).unwrap();
        let (decoded, consumed) = unpack::<T>(&bytes, mode).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_fixed_width_boundaries() {
        for v in [0u16, 1, u16::MAX] {
            roundtrip(v, Mode::Default);
        }
        for v in [0u32, 1, u32::MAX] {
            roundtrip(v, Mode::Default);
        }
        for v in [0u64, 1, u64::MAX] {
            roundtrip(v, Mode::Default);
        }
        for v in [0u8, 1, u8::MAX] {
            roundtrip(v, Mode::Default);
        }
    }

    #[test]
    fn test_fixed_width_is_little_endian() {
        assert_eq!(pack(&258u32, Mode::Default).unwrap().as_ref(), [2, 1, 0, 0]);
        assert_eq!(pack(&1024u16, Mode::Default).unwrap().as_ref(), [0, 4]);
        assert_eq!(pack(&1u64, Mode::Default).unwrap().len(), 8);
    }

    #[test]
    fn test_mode_is_per_call() {
        let fixed = pack(&128u32, Mode::Default).unwrap();
        let ber = pack(&128u32, Mode::Ber).unwrap();
        assert_eq!(fixed.as_ref(), [0x80, 0, 0, 0]);
        assert_eq!(ber.as_ref(), [0x81, 0x00]);
    }

    #[test]
    fn test_ber_mode_boundaries() {
        for v in [0u32, 127, 128, 16383, 16384, u32::MAX] {
            roundtrip(v, Mode::Ber);
        }
        roundtrip(u64::MAX, Mode::Ber);
        roundtrip(u16::MAX, Mode::Ber);
    }

    #[test]
    fn test_ber_overflow_for_destination() {
        let bytes = pack(&70_000u32, Mode::Ber).unwrap();
        let result = unpack::<u16>(&bytes, Mode::Ber);
        assert_eq!(result, Err(PackError::Overflow { kind: "u16" }));
    }

    #[test]
    fn test_signed() {
        roundtrip(-1i32, Mode::Default);
        roundtrip(i64::MIN, Mode::Default);
        roundtrip(-300i16, Mode::Ber);
        roundtrip(-5i8, Mode::Ber);
        assert_eq!(
            pack(&-1i32, Mode::Default).unwrap().as_ref(),
            [0xff, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn test_bool() {
        roundtrip(true, Mode::Default);
        roundtrip(false, Mode::Ber);
        assert!(matches!(
            unpack::<bool>(&[2], Mode::Default),
            Err(PackError::Unsupported(_))
        ));
    }

    #[test]
    fn test_fixed_width_truncated() {
        assert_eq!(
            unpack::<u32>(&[1, 2, 3], Mode::Default),
            Err(PackError::Truncated {
                needed: 4,
                remaining: 3
            })
        );
        assert!(matches!(
            unpack::<u8>(&[], Mode::Default),
            Err(PackError::Truncated { .. })
        ));
    }

    #[test]
    fn test_string_layout() {
        let bytes = pack("hello", Mode::Default).unwrap();
        assert_eq!(bytes.as_ref(), b"\x05\x00\x00\x00hello");

        let bytes = pack("hello", Mode::Ber).unwrap();
        assert_eq!(bytes.as_ref(), b"\x05hello");
    }

    #[test]
    fn test_string_roundtrip() {
        roundtrip(String::from("Hello, iproto!"), Mode::Default);
        roundtrip(String::new(), Mode::Default);
        roundtrip(String::from("ünïcødé"), Mode::Ber);
    }

    #[test]
    fn test_string_truncated_body() {
        // Prefix says 10 bytes, only 3 follow.
        let data = b"\x0a\x00\x00\x00abc";
        assert_eq!(
            unpack::<String>(data, Mode::Default),
            Err(PackError::Truncated {
                needed: 10,
                remaining: 3
            })
        );
    }

    #[test]
    fn test_string_truncated_prefix() {
        assert!(matches!(
            unpack::<String>(&[0x05, 0x00], Mode::Default),
            Err(PackError::Truncated { .. })
        ));
    }

    #[test]
    fn test_string_huge_prefix_does_not_allocate() {
        let data = [0xff, 0xff, 0xff, 0xff, b'a'];
        assert!(matches!(
            unpack::<String>(&data, Mode::Default),
            Err(PackError::Truncated { .. })
        ));
    }

    #[test]
    fn test_string_invalid_utf8() {
        let data = b"\x02\x00\x00\x00\xff\xfe";
        assert_eq!(
            unpack::<String>(data, Mode::Default),
            Err(PackError::InvalidUtf8)
        );
    }

    #[test]
    fn test_bytes_roundtrip() {
        roundtrip(Bytes::from_static(b"\x00\x01\x02"), Mode::Default);
        roundtrip(Bytes::new(), Mode::Ber);
    }

    #[test]
    fn test_vec_roundtrip() {
        roundtrip(vec![1u32, 2, 3], Mode::Default);
        roundtrip(vec![128u32, 0, u32::MAX], Mode::Ber);
        roundtrip(vec![String::from("a"), String::new()], Mode::Default);
        roundtrip(Vec::<u64>::new(), Mode::Default);
    }

    #[test]
    fn test_vec_u8_matches_bytes_layout() {
        let as_vec = pack(&vec![1u8, 2, 3], Mode::Default).unwrap();
        let as_bytes = pack(&Bytes::from_static(&[1, 2, 3]), Mode::Default).unwrap();
        assert_eq!(as_vec, as_bytes);
    }

    #[test]
    fn test_unpack_reports_consumed() {
        let mut buf = BytesMut::new();
        7u32.pack(&mut buf, Mode::Default).unwrap();
        "tail".pack(&mut buf, Mode::Default).unwrap();

        let (first, consumed) = unpack::<u32>(&buf, Mode::Default).unwrap();
        assert_eq!(first, 7);
        assert_eq!(consumed, 4);

        let mut tail = String::new();
        let consumed = unpack_into(&buf[4..], &mut tail, Mode::Default).unwrap();
        assert_eq!(tail, "tail");
        assert_eq!(consumed, 8);
    }

    #[test]
    fn test_unpack_into_leaves_dest_on_error() {
        let mut dest = 99u32;
        assert!(unpack_into(&[1, 2], &mut dest, Mode::Default).is_err());
        assert_eq!(dest, 99);
    }

    proptest! {
        #[test]
        fn prop_u32_roundtrip(value in any::<u32>(), ber in any::<bool>()) {
            let mode = if ber { Mode::Ber } else { Mode::Default };
            let bytes = pack(&value, mode).unwrap();
            prop_assert_eq!(unpack::<u32>(&bytes, mode).unwrap(), (value, bytes.len()));
        }

        #[test]
        fn prop_string_roundtrip(value in ".*") {
            let bytes = pack(&value, Mode::Default).unwrap();
            prop_assert_eq!(bytes.len(), 4 + value.len());
            let (decoded, _) = unpack::<String>(&bytes, Mode::Default).unwrap();
            prop_assert_eq!(decoded, value);
        }

        #[test]
        fn prop_string_truncation_never_overreads(value in "[a-z]{1,32}", cut in 0usize..36) {
            let bytes = pack(&value, Mode::Default).unwrap();
            prop_assume!(cut < bytes.len());
            let result = unpack::<String>(&bytes[..cut], Mode::Default);
            prop_assert!(
                matches!(result, Err(PackError::Truncated { .. })),
                "unexpected result: {:?}",
                result
            );
        }
    }
}
