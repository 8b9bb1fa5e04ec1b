//! Legacy message set (magic 0 and 1) decoding.
//!
//! Before record batches, brokers shipped records as a bare concatenation
//! of `[offset][size][message]` entries. A compressed entry wraps a whole
//! nested message set inside its value; for magic 1 the nested offsets are
//! deltas that the consumer recomputes against the wrapper's offset.
//!
//! A truncated trailing entry is not an error: brokers cut responses at
//! the fetch size mid-message, and the consumer reacts by growing its
//! fetch size and retrying.

use bytes::Bytes;
use nom::number::complete::{be_i8, be_i64, be_u32};
use nombytes::NomBytes;

use crate::compression::{Compression, decompress};
use crate::constants::LEGACY_MESSAGE_SET_HEADER_SIZE;
use crate::error::{Error, Result};
use crate::parser::nullable_bytes_field;

// Attribute bits of a legacy message.
const ATTR_CODEC_MASK: i8 = 0x07;
const ATTR_LOG_APPEND_TIME: i8 = 0x08;

/// A single legacy message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyMessage {
    /// Magic byte: 0 (no timestamp) or 1 (with timestamp).
    pub version: i8,
    pub codec: Compression,
    /// Milliseconds since epoch; -1 on magic 0.
    pub timestamp: i64,
    /// Timestamp is the broker's append time rather than the producer's.
    pub log_append_time: bool,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    /// For a compressed message, the decoded nested message set.
    pub nested: Vec<MessageBlock>,
}

/// A message with the offset the broker stored it at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBlock {
    pub offset: i64,
    pub message: LegacyMessage,
}

impl MessageBlock {
    /// The messages this block stands for: the nested set of a
    /// compressed wrapper, or the block itself.
    pub fn messages(&self) -> &[MessageBlock] {
        if self.message.nested.is_empty() {
            std::slice::from_ref(self)
        } else {
            &self.message.nested
        }
    }
}

/// A decoded legacy message set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageSet {
    pub blocks: Vec<MessageBlock>,
    /// The set ended in the middle of a message.
    pub partial_trailing: bool,
}

impl MessageSet {
    /// Offset directly after the last complete block, if any.
    pub fn next_offset(&self) -> Option<i64> {
        self.blocks.last().map(|b| b.offset + 1)
    }
}

/// Decode a legacy message set area.
///
/// `nested` marks a set recovered from inside a compressed message, where
/// truncation is a corruption rather than a fetch-size artifact.
pub fn parse_message_set(data: &Bytes, nested: bool) -> Result<MessageSet> {
    let mut blocks = Vec::new();
    let mut remaining = data.clone();

    loop {
        if remaining.is_empty() {
            break;
        }
        if remaining.len() < LEGACY_MESSAGE_SET_HEADER_SIZE {
            return partial(nested, blocks);
        }

        let offset = i64::from_be_bytes([
            remaining[0],
            remaining[1],
            remaining[2],
            remaining[3],
            remaining[4],
            remaining[5],
            remaining[6],
            remaining[7],
        ]);
        let size = i32::from_be_bytes([remaining[8], remaining[9], remaining[10], remaining[11]]);
        if size < 0 {
            return Err(Error::MalformedRecord(format!(
                "legacy message with negative size {size}"
            )));
        }
        let size = size as usize;
        if remaining.len() < LEGACY_MESSAGE_SET_HEADER_SIZE + size {
            return partial(nested, blocks);
        }

        let body = remaining.slice(LEGACY_MESSAGE_SET_HEADER_SIZE..LEGACY_MESSAGE_SET_HEADER_SIZE + size);
        let message = parse_message(&body)?;
        blocks.push(MessageBlock { offset, message });

        remaining = remaining.slice(LEGACY_MESSAGE_SET_HEADER_SIZE + size..);
    }

    Ok(MessageSet {
        blocks,
        partial_trailing: false,
    })
}

fn partial(nested: bool, blocks: Vec<MessageBlock>) -> Result<MessageSet> {
    if nested {
        return Err(Error::MalformedRecord(
            "truncated message inside a compressed wrapper".to_string(),
        ));
    }
    Ok(MessageSet {
        blocks,
        partial_trailing: true,
    })
}

fn parse_message(body: &Bytes) -> Result<LegacyMessage> {
    if body.len() < 4 {
        return Err(Error::MalformedRecord(
            "legacy message shorter than its crc".to_string(),
        ));
    }

    // Legacy messages are checksummed with plain CRC-32 (IEEE) over
    // everything after the crc field.
    let stored_crc = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    let computed_crc = crc32fast::hash(&body[4..]);
    if stored_crc != computed_crc {
        return Err(Error::MalformedRecord(format!(
            "legacy message crc mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"
        )));
    }

    let s = NomBytes::new(body.clone());
    let (s, _crc) = be_u32(s).map_err(map_nom)?;
    let (s, version) = be_i8(s).map_err(map_nom)?;
    if !(0..=1).contains(&version) {
        return Err(Error::MalformedRecord(format!(
            "unknown magic {version} in legacy message"
        )));
    }
    let (s, attributes) = be_i8(s).map_err(map_nom)?;
    let (s, timestamp) = if version >= 1 {
        be_i64(s).map_err(map_nom)?
    } else {
        (s, -1)
    };
    let (s, key) = nullable_bytes_field(s).map_err(map_nom)?;
    let (_, value) = nullable_bytes_field(s).map_err(map_nom)?;

    let codec = Compression::try_from(attributes & ATTR_CODEC_MASK)?;
    let log_append_time = version >= 1 && attributes & ATTR_LOG_APPEND_TIME != 0;

    let nested = match (codec, &value) {
        (Compression::None, _) | (_, None) => Vec::new(),
        (codec, Some(wrapped)) => {
            let plain = decompress(codec, wrapped)?;
            parse_message_set(&plain, true)?.blocks
        }
    };

    Ok(LegacyMessage {
        version,
        codec,
        timestamp,
        log_append_time,
        key,
        value,
        nested,
    })
}

fn map_nom(_: nom::Err<nom::error::Error<NomBytes>>) -> Error {
    Error::MalformedRecord("truncated legacy message".to_string())
}
