//! Record batch (magic 2) decoding.
//!
//! A record batch is the modern container format: a fixed 61-byte header
//! followed by a flat array of varint-encoded records. The record area may
//! be compressed as a whole; offsets and timestamps inside records are
//! deltas against the batch header.
//!
//! The header fields, in wire order: base offset (i64), batch length
//! (i32, counted from the next field), partition leader epoch (i32),
//! magic (i8), crc (u32), attributes (i16), last offset delta (i32),
//! first and max timestamps (i64 each), producer id (i64), producer
//! epoch (i16), first sequence (i32), record count (i32). The crc is a
//! CRC-32C over everything from the attributes to the end of the batch,
//! so the fields a broker may rewrite in place (offset, epoch) stay
//! outside the checksummed region.
//!
//! Control batches carry a single marker record (commit or abort) written
//! by the transaction coordinator; they are never delivered to the
//! application but drive aborted-transaction filtering.

use bytes::Bytes;
use nom::number::complete::{be_i8, be_i16, be_i32, be_i64, be_u32};
use nombytes::NomBytes;

use crate::compression::{Compression, decompress};
use crate::constants::{BATCH_CRC_DATA_START, MIN_BATCH_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::parser::{varint_bytes_field, zigzag_varint};

/// CRC-32C (Castagnoli), bit-at-a-time over the reflected polynomial.
///
/// Decoding is dominated by decompression and allocation, so the
/// table-free form is fast enough here and trivially auditable against
/// the polynomial.
pub fn castagnoli(data: &[u8]) -> u32 {
    const REFLECTED_POLY: u32 = 0x82F6_3B78;

    let mut state = u32::MAX;
    for b in data.iter().copied() {
        state ^= u32::from(b);
        for _ in 0..8 {
            let carry = state & 1 != 0;
            state >>= 1;
            if carry {
                state ^= REFLECTED_POLY;
            }
        }
    }
    !state
}

/// A single (name, value) header attached to a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: String,
    pub value: Option<Bytes>,
}

/// One record inside a batch. Offset and timestamp are deltas relative
/// to the batch's `first_offset` / `first_timestamp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset_delta: i64,
    pub timestamp_delta: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<RecordHeader>,
}

/// Marker written by the transaction coordinator into a control batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRecordType {
    Abort,
    Commit,
    Unknown(i16),
}

/// The typed body of a control record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRecord {
    pub version: i16,
    pub record_type: ControlRecordType,
}

/// A decoded record batch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecordBatch {
    pub first_offset: i64,
    pub partition_leader_epoch: i32,
    pub codec: Compression,
    pub transactional: bool,
    pub control: bool,
    /// When set, every record in the batch carries the broker's append
    /// time (`max_timestamp`) instead of the producer's timestamps.
    pub log_append_time: bool,
    pub last_offset_delta: i32,
    pub first_timestamp: i64,
    pub max_timestamp: i64,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub first_sequence: i32,
    pub records: Vec<Record>,
}

impl RecordBatch {
    /// Offset of the last record covered by this batch, including any
    /// records compacted away.
    pub fn last_offset(&self) -> i64 {
        self.first_offset + self.last_offset_delta as i64
    }

    /// Offset directly after this batch.
    pub fn next_offset(&self) -> i64 {
        self.last_offset() + 1
    }

    /// Decode the control marker from a control batch.
    ///
    /// The marker lives in the key of the batch's only record:
    /// a version and a type, both i16. Type 0 is abort, 1 is commit.
    pub fn control_record(&self) -> Result<ControlRecord> {
        if !self.control {
            return Err(Error::MalformedRecord(
                "control record requested from a data batch".to_string(),
            ));
        }

        let key = self
            .records
            .first()
            .and_then(|r| r.key.as_ref())
            .ok_or_else(|| {
                Error::MalformedRecord("control batch without a marker record".to_string())
            })?;

        if key.len() < 4 {
            return Err(Error::MalformedRecord(
                "control record key too short".to_string(),
            ));
        }

        let version = i16::from_be_bytes([key[0], key[1]]);
        let record_type = match i16::from_be_bytes([key[2], key[3]]) {
            0 => ControlRecordType::Abort,
            1 => ControlRecordType::Commit,
            other => ControlRecordType::Unknown(other),
        };

        Ok(ControlRecord {
            version,
            record_type,
        })
    }
}

// Attribute bits of the batch header.
const ATTR_CODEC_MASK: i16 = 0x07;
const ATTR_LOG_APPEND_TIME: i16 = 0x08;
const ATTR_TRANSACTIONAL: i16 = 0x10;
const ATTR_CONTROL: i16 = 0x20;

/// Decode a complete record batch entry (starting at `base_offset`).
///
/// The caller is responsible for entry framing: `data` must hold exactly
/// one batch whose declared length fits. Fails with
/// [`Error::MalformedRecord`] on a checksum mismatch or a truncated
/// record area.
pub fn parse_record_batch(data: &Bytes) -> Result<RecordBatch> {
    if data.len() < MIN_BATCH_HEADER_SIZE {
        return Err(Error::MalformedRecord(format!(
            "record batch of {} bytes is shorter than the 61-byte header",
            data.len()
        )));
    }

    let s = NomBytes::new(data.clone());
    let (s, first_offset) = be_i64(s).map_err(map_nom(data))?;
    let (s, _batch_length) = be_i32(s).map_err(map_nom(data))?;
    let (s, partition_leader_epoch) = be_i32(s).map_err(map_nom(data))?;
    let (s, magic) = be_i8(s).map_err(map_nom(data))?;
    if magic != 2 {
        return Err(Error::MalformedRecord(format!(
            "unexpected magic {magic} in record batch"
        )));
    }
    let (s, stored_crc) = be_u32(s).map_err(map_nom(data))?;
    let computed_crc = castagnoli(&data[BATCH_CRC_DATA_START..]);
    if stored_crc != computed_crc {
        return Err(Error::MalformedRecord(format!(
            "record batch crc32c mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"
        )));
    }
    let (s, attributes) = be_i16(s).map_err(map_nom(data))?;
    let (s, last_offset_delta) = be_i32(s).map_err(map_nom(data))?;
    let (s, first_timestamp) = be_i64(s).map_err(map_nom(data))?;
    let (s, max_timestamp) = be_i64(s).map_err(map_nom(data))?;
    let (s, producer_id) = be_i64(s).map_err(map_nom(data))?;
    let (s, producer_epoch) = be_i16(s).map_err(map_nom(data))?;
    let (s, first_sequence) = be_i32(s).map_err(map_nom(data))?;
    let (s, records_count) = be_i32(s).map_err(map_nom(data))?;

    if records_count < 0 {
        return Err(Error::MalformedRecord(format!(
            "record batch claims {records_count} records"
        )));
    }

    let codec = Compression::try_from((attributes & ATTR_CODEC_MASK) as i8)?;

    let records_area = s.into_bytes();
    let plain = match codec {
        Compression::None => records_area,
        other => decompress(other, &records_area)?,
    };

    let mut records = Vec::with_capacity(records_count as usize);
    let mut s = NomBytes::new(plain);
    for _ in 0..records_count {
        let (rest, record) = parse_record(s).map_err(map_nom(data))?;
        records.push(record);
        s = rest;
    }

    Ok(RecordBatch {
        first_offset,
        partition_leader_epoch,
        codec,
        transactional: attributes & ATTR_TRANSACTIONAL != 0,
        control: attributes & ATTR_CONTROL != 0,
        log_append_time: attributes & ATTR_LOG_APPEND_TIME != 0,
        last_offset_delta,
        first_timestamp,
        max_timestamp,
        producer_id,
        producer_epoch,
        first_sequence,
        records,
    })
}

fn parse_record(s: NomBytes) -> nom::IResult<NomBytes, Record> {
    let (s, _length) = zigzag_varint(s)?;
    let (s, _attributes) = be_i8(s)?;
    let (s, timestamp_delta) = zigzag_varint(s)?;
    let (s, offset_delta) = zigzag_varint(s)?;
    let (s, key) = varint_bytes_field(s)?;
    let (s, value) = varint_bytes_field(s)?;
    let (mut s, header_count) = zigzag_varint(s)?;

    let mut headers = Vec::with_capacity(header_count.max(0) as usize);
    for _ in 0..header_count {
        let (rest, name) = varint_bytes_field(s)?;
        let (rest, value) = varint_bytes_field(rest)?;
        // header names are required and must be text
        let key = name
            .as_deref()
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .ok_or_else(|| {
                nom::Err::Failure(nom::error::Error::new(
                    rest.clone(),
                    nom::error::ErrorKind::Verify,
                ))
            })?
            .to_owned();
        headers.push(RecordHeader { key, value });
        s = rest;
    }

    Ok((
        s,
        Record {
            offset_delta,
            timestamp_delta,
            key,
            value,
            headers,
        },
    ))
}

fn map_nom(data: &Bytes) -> impl Fn(nom::Err<nom::error::Error<NomBytes>>) -> Error + '_ {
    move |_| Error::MalformedRecord(format!("truncated record batch ({} bytes)", data.len()))
}
