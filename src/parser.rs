//! Field-level parsers for the fetch wire format.
//!
//! Everything here operates on [`NomBytes`] so that sub-slices of a
//! response share the original buffer instead of copying. Two encodings
//! coexist on the wire and both are covered:
//!
//! - classic fields: big-endian integers, `u16`-length strings,
//!   `i32`-length byte blobs where `-1` stands for null, and
//!   `i32`-counted arrays;
//! - record fields (inside v2 batches): zigzag varints for every integer
//!   and length.
//!
//! Array and varint parsers refuse absurd lengths up front so a hostile
//! response cannot make the client allocate unbounded memory.

use bytes::Bytes;
use nom::{IResult, bytes::complete::take, number::complete::{be_i32, be_u16}};
use nombytes::NomBytes;

use crate::constants::MAX_PROTOCOL_ARRAY_SIZE;

fn fail<T>(at: NomBytes, kind: nom::error::ErrorKind) -> IResult<NomBytes, T> {
    Err(nom::Err::Failure(nom::error::Error::new(at, kind)))
}

/// A `u16`-length-prefixed UTF-8 string.
///
/// Invalid UTF-8 is a hard failure: topic names travel into registry
/// keys, so garbage must not get that far.
pub fn string_field(input: NomBytes) -> IResult<NomBytes, String> {
    let (rest, len) = be_u16(input)?;
    let (rest, raw) = take(len)(rest)?;
    let raw = raw.into_bytes();
    match std::str::from_utf8(&raw) {
        Ok(text) => Ok((rest, text.to_owned())),
        Err(_) => fail(rest, nom::error::ErrorKind::Char),
    }
}

/// An `i32`-length byte blob; a length of `-1` decodes as `None`.
pub fn nullable_bytes_field(input: NomBytes) -> IResult<NomBytes, Option<Bytes>> {
    let (rest, len) = be_i32(input)?;
    match len {
        -1 => Ok((rest, None)),
        n if n < 0 => fail(rest, nom::error::ErrorKind::Verify),
        n => {
            let (rest, data) = take(n as u32)(rest)?;
            Ok((rest, Some(data.into_bytes())))
        }
    }
}

/// An `i32`-counted sequence of `item`s.
///
/// A count of `-1` (null array) decodes as empty, matching how the
/// consumer treats an absent list. Counts above
/// [`MAX_PROTOCOL_ARRAY_SIZE`] are rejected outright.
pub fn counted_array<O, F>(mut item: F) -> impl FnMut(NomBytes) -> IResult<NomBytes, Vec<O>>
where
    F: FnMut(NomBytes) -> IResult<NomBytes, O>,
{
    move |input: NomBytes| {
        let (mut rest, count) = be_i32(input)?;
        if count == -1 {
            return Ok((rest, Vec::new()));
        }
        if count < 0 || count > MAX_PROTOCOL_ARRAY_SIZE {
            return fail(rest, nom::error::ErrorKind::TooLarge);
        }
        // the claimed count is untrusted; cap the preallocation
        let mut items = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let (after, parsed) = item(rest)?;
            items.push(parsed);
            rest = after;
        }
        Ok((rest, items))
    }
}

/// An unsigned LEB128-style varint, at most ten bytes for 64 bits.
pub fn unsigned_varint(input: NomBytes) -> IResult<NomBytes, u64> {
    let mut value = 0u64;
    let mut rest = input;
    for shift in (0..64).step_by(7) {
        let (after, chunk) = take(1usize)(rest)?;
        let byte = chunk.into_bytes()[0];
        rest = after;
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok((rest, value));
        }
    }
    // continuation bit still set after ten bytes
    fail(rest, nom::error::ErrorKind::TooLarge)
}

/// A zigzag-encoded signed varint, the integer encoding inside v2
/// records.
pub fn zigzag_varint(input: NomBytes) -> IResult<NomBytes, i64> {
    let (rest, raw) = unsigned_varint(input)?;
    let magnitude = (raw >> 1) as i64;
    let sign = -((raw & 1) as i64);
    Ok((rest, magnitude ^ sign))
}

/// A byte blob with a zigzag varint length prefix, where a negative
/// length decodes as `None`. Record keys, values, and header values use
/// this shape.
pub fn varint_bytes_field(input: NomBytes) -> IResult<NomBytes, Option<Bytes>> {
    let (rest, len) = zigzag_varint(input)?;
    if len < 0 {
        return Ok((rest, None));
    }
    let (rest, data) = take(len as u64)(rest)?;
    Ok((rest, Some(data.into_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use nom::number::complete::be_i16;

    fn input(data: Vec<u8>) -> NomBytes {
        NomBytes::new(Bytes::from(data))
    }

    #[test]
    fn string_field_reads_length_prefixed_utf8() {
        let text = "grüße-k9";
        let mut data = Vec::new();
        data.put_u16(text.len() as u16); // byte length, not char count
        data.put_slice(text.as_bytes());
        data.put_slice(b"trailer");

        let (rest, parsed) = string_field(input(data)).unwrap();
        assert_eq!(parsed, text);
        assert_eq!(rest.into_bytes(), Bytes::from("trailer"));
    }

    #[test]
    fn string_field_rejects_invalid_utf8() {
        let mut data = Vec::new();
        data.put_u16(2);
        data.put_slice(&[0xC0, 0x00]); // malformed sequence
        assert!(string_field(input(data)).is_err());
    }

    #[test]
    fn string_field_needs_the_whole_string() {
        let mut data = Vec::new();
        data.put_u16(10);
        data.put_slice(b"short");
        assert!(string_field(input(data)).is_err());
    }

    #[test]
    fn nullable_bytes_minus_one_is_none() {
        let mut data = Vec::new();
        data.put_i32(-1);
        let (_, parsed) = nullable_bytes_field(input(data)).unwrap();
        assert_eq!(parsed, None);
    }

    #[test]
    fn nullable_bytes_zero_is_empty_not_none() {
        let mut data = Vec::new();
        data.put_i32(0);
        let (_, parsed) = nullable_bytes_field(input(data)).unwrap();
        assert_eq!(parsed, Some(Bytes::new()));
    }

    #[test]
    fn nullable_bytes_reads_payload() {
        let mut data = Vec::new();
        data.put_i32(4);
        data.put_slice(&[9, 8, 7, 6]);
        data.put_u8(0xEE);

        let (rest, parsed) = nullable_bytes_field(input(data)).unwrap();
        assert_eq!(parsed, Some(Bytes::from(vec![9, 8, 7, 6])));
        assert_eq!(rest.into_bytes(), Bytes::from(vec![0xEE]));
    }

    #[test]
    fn nullable_bytes_rejects_other_negative_lengths() {
        let mut data = Vec::new();
        data.put_i32(-3);
        assert!(nullable_bytes_field(input(data)).is_err());
    }

    #[test]
    fn counted_array_collects_each_item() {
        let mut data = Vec::new();
        data.put_i32(3);
        for v in [7i16, 8, 9] {
            data.put_i16(v);
        }

        let (_, parsed) = counted_array(be_i16)(input(data)).unwrap();
        assert_eq!(parsed, vec![7, 8, 9]);
    }

    #[test]
    fn counted_array_null_and_zero_both_decode_empty() {
        for count in [-1i32, 0] {
            let data = count.to_be_bytes().to_vec();
            let (_, parsed) = counted_array(be_i16)(input(data)).unwrap();
            assert!(parsed.is_empty(), "count {count}");
        }
    }

    #[test]
    fn counted_array_rejects_absurd_counts() {
        for count in [-2, MAX_PROTOCOL_ARRAY_SIZE + 1] {
            let data = count.to_be_bytes().to_vec();
            assert!(counted_array(be_i16)(input(data)).is_err(), "count {count}");
        }
    }

    #[test]
    fn counted_array_fails_when_items_run_out() {
        let mut data = Vec::new();
        data.put_i32(2);
        data.put_i16(1); // only one of the two promised items
        assert!(counted_array(be_i16)(input(data)).is_err());
    }

    #[test]
    fn unsigned_varint_boundaries() {
        for (bytes, expected) in [
            (vec![0x00], 0u64),
            (vec![0x7F], 127),
            (vec![0x80, 0x01], 128),
            (vec![0xAC, 0x02], 300),
            (
                vec![0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01],
                u64::MAX,
            ),
        ] {
            let (_, value) = unsigned_varint(input(bytes.clone())).unwrap();
            assert_eq!(value, expected, "bytes {bytes:?}");
        }
    }

    #[test]
    fn unsigned_varint_stops_at_ten_bytes() {
        // eleven continuation bytes never terminate
        let data = vec![0x80; 11];
        assert!(unsigned_varint(input(data)).is_err());
    }

    #[test]
    fn unsigned_varint_truncated_input() {
        let data = vec![0x80];
        assert!(unsigned_varint(input(data)).is_err());
    }

    #[test]
    fn zigzag_interleaves_signs() {
        for (byte, expected) in [(0x00u8, 0i64), (0x01, -1), (0x02, 1), (0x03, -2), (0x04, 2)] {
            let (_, value) = zigzag_varint(input(vec![byte])).unwrap();
            assert_eq!(value, expected);
        }
    }

    #[test]
    fn zigzag_multi_byte_value() {
        // 300 on the wire decodes to 150
        let (_, value) = zigzag_varint(input(vec![0xAC, 0x02])).unwrap();
        assert_eq!(value, 150);
    }

    #[test]
    fn varint_bytes_negative_length_is_none() {
        let (_, parsed) = varint_bytes_field(input(vec![0x01])).unwrap();
        assert_eq!(parsed, None);
    }

    #[test]
    fn varint_bytes_reads_payload() {
        let mut data = vec![0x06]; // zigzag for 3
        data.put_slice(b"xyz");
        let (_, parsed) = varint_bytes_field(input(data)).unwrap();
        assert_eq!(parsed, Some(Bytes::from("xyz")));
    }

    #[test]
    fn varint_bytes_empty_payload() {
        let (_, parsed) = varint_bytes_field(input(vec![0x00])).unwrap();
        assert_eq!(parsed, Some(Bytes::new()));
    }
}
