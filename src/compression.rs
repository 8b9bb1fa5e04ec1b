//! Decompression of record containers.
//!
//! Brokers may deliver record batches (and legacy message blocks)
//! compressed with one of four codecs. The codec is carried in the
//! container's attributes; this module turns the compressed payload back
//! into the plain bytes the record parsers operate on.
//!
//! # Snappy
//!
//! Snappy arrives in three shapes in the wild and all must be handled:
//!
//! - the official framing format (stream starts with the `sNaPpY` chunk),
//! - the bulk ("xerial") framing emitted by the historical Java client
//!   (magic header `\x82SNAPPY\x00`, then length-prefixed raw blocks),
//! - a bare raw block with no framing at all (v2 record batches).

use std::io::Read;

use bytes::Bytes;

use crate::error::{Error, Result};

/// Compression codec identifiers, as carried in the low bits of the
/// attributes field of both container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None = 0,
    Gzip = 1,
    Snappy = 2,
    Lz4 = 3,
    Zstd = 4,
}

impl TryFrom<i8> for Compression {
    type Error = Error;

    fn try_from(value: i8) -> Result<Self> {
        match value {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Gzip),
            2 => Ok(Compression::Snappy),
            3 => Ok(Compression::Lz4),
            4 => Ok(Compression::Zstd),
            otherwise => Err(Error::UnsupportedCodec(otherwise)),
        }
    }
}

/// Magic header of the bulk ("xerial") snappy framing.
const SNAPPY_BULK_MAGIC: &[u8] = &[0x82, b'S', b'N', b'A', b'P', b'P', b'Y', 0x00];

/// Chunk identifier that opens the official snappy framing format.
const SNAPPY_FRAME_MAGIC: &[u8] = &[0xFF, 0x06, 0x00, 0x00, b's', b'N', b'a', b'P', b'p', b'Y'];

/// Decompress a record container payload with the given codec.
pub fn decompress(codec: Compression, data: &[u8]) -> Result<Bytes> {
    match codec {
        Compression::None => Ok(Bytes::copy_from_slice(data)),
        Compression::Gzip => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| Error::MalformedRecord(format!("gzip: {e}")))?;
            Ok(out.into())
        }
        Compression::Snappy => decompress_snappy(data),
        Compression::Lz4 => {
            let mut out = Vec::new();
            lz4_flex::frame::FrameDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| Error::MalformedRecord(format!("lz4: {e}")))?;
            Ok(out.into())
        }
        Compression::Zstd => zstd::decode_all(data)
            .map(Bytes::from)
            .map_err(|e| Error::MalformedRecord(format!("zstd: {e}"))),
    }
}

fn decompress_snappy(data: &[u8]) -> Result<Bytes> {
    if data.starts_with(SNAPPY_BULK_MAGIC) {
        return decompress_snappy_bulk(&data[SNAPPY_BULK_MAGIC.len()..]);
    }

    if data.starts_with(SNAPPY_FRAME_MAGIC) {
        let mut out = Vec::new();
        snap::read::FrameDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| Error::MalformedRecord(format!("snappy frame: {e}")))?;
        return Ok(out.into());
    }

    snap::raw::Decoder::new()
        .decompress_vec(data)
        .map(Bytes::from)
        .map_err(|e| Error::MalformedRecord(format!("snappy: {e}")))
}

/// Bulk framing: default version/compat words, then a sequence of
/// `[len: u32][raw snappy block]` chunks.
fn decompress_snappy_bulk(mut data: &[u8]) -> Result<Bytes> {
    if data.len() < 8 {
        return Err(Error::MalformedRecord(
            "snappy bulk: truncated header".to_string(),
        ));
    }
    // version + compatible version words
    data = &data[8..];

    let mut out = Vec::new();
    let mut decoder = snap::raw::Decoder::new();
    while !data.is_empty() {
        if data.len() < 4 {
            return Err(Error::MalformedRecord(
                "snappy bulk: truncated chunk length".to_string(),
            ));
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        data = &data[4..];
        if data.len() < len {
            return Err(Error::MalformedRecord(
                "snappy bulk: truncated chunk".to_string(),
            ));
        }
        let chunk = decoder
            .decompress_vec(&data[..len])
            .map_err(|e| Error::MalformedRecord(format!("snappy bulk: {e}")))?;
        out.extend_from_slice(&chunk);
        data = &data[len..];
    }
    Ok(out.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PAYLOAD: &[u8] = b"a quality message, worth compressing many times over";

    #[test]
    fn test_codec_from_attributes() {
        assert_eq!(Compression::try_from(0).unwrap(), Compression::None);
        assert_eq!(Compression::try_from(1).unwrap(), Compression::Gzip);
        assert_eq!(Compression::try_from(2).unwrap(), Compression::Snappy);
        assert_eq!(Compression::try_from(3).unwrap(), Compression::Lz4);
        assert_eq!(Compression::try_from(4).unwrap(), Compression::Zstd);
        assert_eq!(
            Compression::try_from(5),
            Err(Error::UnsupportedCodec(5))
        );
    }

    #[test]
    fn test_none_is_identity() {
        let out = decompress(Compression::None, PAYLOAD).unwrap();
        assert_eq!(&out[..], PAYLOAD);
    }

    #[test]
    fn test_gzip_round_trip() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(PAYLOAD).unwrap();
        let compressed = encoder.finish().unwrap();

        let out = decompress(Compression::Gzip, &compressed).unwrap();
        assert_eq!(&out[..], PAYLOAD);
    }

    #[test]
    fn test_snappy_raw_round_trip() {
        let compressed = snap::raw::Encoder::new().compress_vec(PAYLOAD).unwrap();
        let out = decompress(Compression::Snappy, &compressed).unwrap();
        assert_eq!(&out[..], PAYLOAD);
    }

    #[test]
    fn test_snappy_framed_round_trip() {
        let mut encoder = snap::write::FrameEncoder::new(Vec::new());
        encoder.write_all(PAYLOAD).unwrap();
        let compressed = encoder.into_inner().unwrap();
        assert!(compressed.starts_with(SNAPPY_FRAME_MAGIC));

        let out = decompress(Compression::Snappy, &compressed).unwrap();
        assert_eq!(&out[..], PAYLOAD);
    }

    #[test]
    fn test_snappy_bulk_round_trip() {
        // Build an xerial-framed stream with two chunks.
        let mut data = Vec::new();
        data.extend_from_slice(SNAPPY_BULK_MAGIC);
        data.extend_from_slice(&1u32.to_be_bytes()); // version
        data.extend_from_slice(&1u32.to_be_bytes()); // compatible version
        let mut encoder = snap::raw::Encoder::new();
        for half in [&PAYLOAD[..20], &PAYLOAD[20..]] {
            let chunk = encoder.compress_vec(half).unwrap();
            data.extend_from_slice(&(chunk.len() as u32).to_be_bytes());
            data.extend_from_slice(&chunk);
        }

        let out = decompress(Compression::Snappy, &data).unwrap();
        assert_eq!(&out[..], PAYLOAD);
    }

    #[test]
    fn test_snappy_bulk_truncated_chunk() {
        let mut data = Vec::new();
        data.extend_from_slice(SNAPPY_BULK_MAGIC);
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(&100u32.to_be_bytes()); // chunk longer than input

        let result = decompress(Compression::Snappy, &data);
        assert!(matches!(result, Err(Error::MalformedRecord(_))));
    }

    #[test]
    fn test_lz4_round_trip() {
        let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
        encoder.write_all(PAYLOAD).unwrap();
        let compressed = encoder.finish().unwrap();

        let out = decompress(Compression::Lz4, &compressed).unwrap();
        assert_eq!(&out[..], PAYLOAD);
    }

    #[test]
    fn test_zstd_round_trip() {
        let compressed = zstd::encode_all(PAYLOAD, 0).unwrap();
        let out = decompress(Compression::Zstd, &compressed).unwrap();
        assert_eq!(&out[..], PAYLOAD);
    }

    #[test]
    fn test_garbage_input_is_rejected() {
        for codec in [Compression::Gzip, Compression::Lz4, Compression::Zstd] {
            let result = decompress(codec, b"\x01\x02\x03\x04 not compressed");
            assert!(matches!(result, Err(Error::MalformedRecord(_))), "{codec:?}");
        }
    }
}
