//! Field-level encoders for the fetch wire format.
//!
//! The counterpart of [`crate::parser`]: fixed-width fields implement
//! [`WireEncode`], while arrays and the varint shapes used inside v2
//! records get free functions. Encoding into a [`BufMut`] cannot fail,
//! so nothing here returns a `Result`; framing mistakes surface as
//! decode errors on the other side, not as encode errors here.

use bytes::BufMut;

/// A value with a fixed wire representation.
pub trait WireEncode {
    fn put<B: BufMut>(&self, out: &mut B);
}

macro_rules! big_endian_int {
    ($($ty:ty => $method:ident),* $(,)?) => {$(
        impl WireEncode for $ty {
            fn put<B: BufMut>(&self, out: &mut B) {
                out.$method(*self);
            }
        }
    )*};
}

big_endian_int! {
    i8 => put_i8,
    i16 => put_i16,
    i32 => put_i32,
    i64 => put_i64,
}

impl WireEncode for str {
    /// `u16` length prefix followed by the UTF-8 bytes.
    fn put<B: BufMut>(&self, out: &mut B) {
        out.put_u16(self.len() as u16);
        out.put_slice(self.as_bytes());
    }
}

impl WireEncode for String {
    fn put<B: BufMut>(&self, out: &mut B) {
        self.as_str().put(out);
    }
}

/// An `i32`-counted sequence: the length, then each item rendered by
/// `each`.
pub fn put_array<B, T>(out: &mut B, items: &[T], mut each: impl FnMut(&mut B, &T))
where
    B: BufMut,
{
    out.put_i32(items.len() as i32);
    for item in items {
        each(out, item);
    }
}

/// An unsigned LEB128-style varint: seven payload bits per byte, high
/// bit marking continuation.
pub fn put_unsigned_varint<B: BufMut>(out: &mut B, mut value: u64) {
    while value >= 0x80 {
        out.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.put_u8(value as u8);
}

/// A zigzag-encoded signed varint, the integer encoding inside v2
/// records.
pub fn put_zigzag_varint<B: BufMut>(out: &mut B, value: i64) {
    put_unsigned_varint(out, ((value << 1) ^ (value >> 63)) as u64);
}

/// A byte blob with a zigzag varint length prefix; `None` is written as
/// length -1.
pub fn put_varint_bytes<B: BufMut>(out: &mut B, value: Option<&[u8]>) {
    match value {
        Some(data) => {
            put_zigzag_varint(out, data.len() as i64);
            out.put_slice(data);
        }
        None => put_zigzag_varint(out, -1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{unsigned_varint, varint_bytes_field, zigzag_varint};
    use bytes::Bytes;
    use nombytes::NomBytes;

    fn rendered(f: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut out = Vec::new();
        f(&mut out);
        out
    }

    #[test]
    fn ints_render_big_endian() {
        assert_eq!(rendered(|out| 0x5Ai8.put(out)), [0x5A]);
        assert_eq!(rendered(|out| (-2i16).put(out)), [0xFF, 0xFE]);
        assert_eq!(
            rendered(|out| 0x0A0B0C0Di32.put(out)),
            [0x0A, 0x0B, 0x0C, 0x0D]
        );
        assert_eq!(
            rendered(|out| 0x1122334455667788i64.put(out)),
            [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]
        );
    }

    #[test]
    fn strings_carry_a_u16_length() {
        let out = rendered(|out| "topic-a".put(out));
        assert_eq!(&out[..2], [0x00, 0x07]);
        assert_eq!(&out[2..], b"topic-a");

        // String delegates to str
        assert_eq!(rendered(|out| "x".to_string().put(out)), [0x00, 0x01, b'x']);
        assert_eq!(rendered(|out| "".put(out)), [0x00, 0x00]);
    }

    #[test]
    fn arrays_lead_with_their_count() {
        let out = rendered(|out| put_array(out, &[5i32, 6], |out, v| v.put(out)));
        assert_eq!(
            out,
            [
                0x00, 0x00, 0x00, 0x02, // two items
                0x00, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0x06,
            ]
        );

        let empty: &[i32] = &[];
        let out = rendered(|out| put_array(out, empty, |out, v| v.put(out)));
        assert_eq!(out, [0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn unsigned_varint_known_encodings() {
        assert_eq!(rendered(|out| put_unsigned_varint(out, 0)), [0x00]);
        assert_eq!(rendered(|out| put_unsigned_varint(out, 127)), [0x7F]);
        assert_eq!(rendered(|out| put_unsigned_varint(out, 128)), [0x80, 0x01]);
        assert_eq!(rendered(|out| put_unsigned_varint(out, 300)), [0xAC, 0x02]);
    }

    #[test]
    fn unsigned_varint_survives_the_parser() {
        for value in [0u64, 1, 255, 16_383, 16_384, u64::MAX] {
            let out = rendered(|out| put_unsigned_varint(out, value));
            let (_, decoded) = unsigned_varint(NomBytes::new(Bytes::from(out))).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn zigzag_varint_survives_the_parser() {
        for value in [0i64, -1, 1, 63, -64, 1 << 20, i64::MAX, i64::MIN] {
            let out = rendered(|out| put_zigzag_varint(out, value));
            let (_, decoded) = zigzag_varint(NomBytes::new(Bytes::from(out))).unwrap();
            assert_eq!(decoded, value, "value {value}");
        }
    }

    #[test]
    fn varint_bytes_survive_the_parser() {
        for payload in [Some(&b"record-key"[..]), Some(&b""[..]), None] {
            let out = rendered(|out| put_varint_bytes(out, payload));
            let (_, decoded) = varint_bytes_field(NomBytes::new(Bytes::from(out))).unwrap();
            assert_eq!(decoded.as_deref(), payload);
        }
    }
}
