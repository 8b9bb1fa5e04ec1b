//! Fetch API request and response.
//!
//! The request side is an encoder: one coalesced request carries a block
//! per subscribed partition. The response side is a decoder: per-partition
//! blocks with watermarks, aborted-transaction ranges, and the raw record
//! area, which is sniffed per entry (magic byte) and decoded into legacy
//! message sets or record batches.
//!
//! Version-dependent fields follow the matrix in
//! [`crate::protocol::versions`].

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use nom::IResult;
use nom::number::complete::{be_i16, be_i32, be_i64};
use nombytes::NomBytes;
use num_traits::FromPrimitive;

use crate::config::{Config, IsolationLevel};
use crate::constants::{
    FETCH_SESSION_EPOCH_NONE, FETCH_SESSION_NONE, MAGIC_BYTE_OFFSET, MAX_RESPONSE_BYTES,
    NO_PREFERRED_REPLICA,
};
use crate::encode::{WireEncode, put_array};
use crate::error::{Error, KafkaCode, Result};
use crate::parser::{counted_array, nullable_bytes_field, string_field};
use crate::protocol::legacy::{MessageSet, parse_message_set};
use crate::protocol::record::{RecordBatch, parse_record_batch};
use crate::protocol::versions::fetch_version;

/// One partition's slot in a fetch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequestBlock {
    pub partition: i32,
    /// Sent on v9+ so the broker can fence reads across leader changes.
    pub current_leader_epoch: i32,
    pub fetch_offset: i64,
    /// Earliest local offset known to a follower; always -1 for consumers.
    pub log_start_offset: i64,
    pub max_bytes: i32,
}

/// Blocks for one topic, in subscription order (the broker honors the
/// order from v3 on).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequestTopic {
    pub name: String,
    pub partitions: Vec<FetchRequestBlock>,
}

/// A versioned fetch request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub version: i16,
    pub max_wait_ms: i32,
    pub min_bytes: i32,
    pub max_bytes: i32,
    pub isolation_level: IsolationLevel,
    pub session_id: i32,
    pub session_epoch: i32,
    pub rack_id: Option<String>,
    pub topics: Vec<FetchRequestTopic>,
}

impl FetchRequest {
    /// Build an empty request negotiated from the configuration.
    pub fn from_config(config: &Config) -> Self {
        let version = fetch_version(config.version);
        Self {
            version,
            max_wait_ms: config.max_wait_time.as_millis() as i32,
            min_bytes: config.fetch.min,
            max_bytes: MAX_RESPONSE_BYTES,
            isolation_level: config.isolation_level,
            session_id: FETCH_SESSION_NONE,
            session_epoch: FETCH_SESSION_EPOCH_NONE,
            rack_id: if version >= 11 {
                config.rack_id.clone()
            } else {
                None
            },
            topics: Vec::new(),
        }
    }

    /// Append a partition block, preserving request order.
    pub fn add_block(
        &mut self,
        topic: &str,
        partition: i32,
        fetch_offset: i64,
        max_bytes: i32,
        leader_epoch: i32,
    ) {
        let block = FetchRequestBlock {
            partition,
            current_leader_epoch: leader_epoch,
            fetch_offset,
            log_start_offset: -1,
            max_bytes,
        };
        match self.topics.iter_mut().find(|t| t.name == topic) {
            Some(t) => t.partitions.push(block),
            None => self.topics.push(FetchRequestTopic {
                name: topic.to_string(),
                partitions: vec![block],
            }),
        }
    }

    /// Total number of partition blocks across all topics.
    pub fn num_blocks(&self) -> usize {
        self.topics.iter().map(|t| t.partitions.len()).sum()
    }

    /// Look up the block for a partition, if present.
    pub fn block(&self, topic: &str, partition: i32) -> Option<&FetchRequestBlock> {
        self.topics
            .iter()
            .find(|t| t.name == topic)?
            .partitions
            .iter()
            .find(|p| p.partition == partition)
    }

    /// Encode the request body for its negotiated version.
    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(256);

        (-1i32).put(&mut buffer); // replica_id: always a consumer
        self.max_wait_ms.put(&mut buffer);
        self.min_bytes.put(&mut buffer);
        if self.version >= 3 {
            self.max_bytes.put(&mut buffer);
        }
        if self.version >= 4 {
            (self.isolation_level as i8).put(&mut buffer);
        }
        if self.version >= 7 {
            self.session_id.put(&mut buffer);
            self.session_epoch.put(&mut buffer);
        }

        put_array(&mut buffer, &self.topics, |buffer, topic| {
            topic.name.put(buffer);
            put_array(buffer, &topic.partitions, |buffer, block| {
                block.partition.put(buffer);
                if self.version >= 9 {
                    block.current_leader_epoch.put(buffer);
                }
                block.fetch_offset.put(buffer);
                if self.version >= 5 {
                    block.log_start_offset.put(buffer);
                }
                block.max_bytes.put(buffer);
            });
        });

        if self.version >= 7 {
            // forgotten topics: sessions are disabled, so always empty
            0i32.put(&mut buffer);
        }
        if self.version >= 11 {
            self.rack_id.as_deref().unwrap_or("").put(&mut buffer);
        }

        buffer.freeze()
    }
}

/// An aborted-transaction range advertised alongside fetched records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortedTransaction {
    pub producer_id: i64,
    pub first_offset: i64,
}

/// One decoded record container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Records {
    Legacy(MessageSet),
    Default(RecordBatch),
}

impl Records {
    /// Number of user-visible record slots in this container.
    pub fn num_records(&self) -> usize {
        match self {
            Records::Legacy(set) => set.blocks.iter().map(|b| b.messages().len()).sum(),
            Records::Default(batch) => batch.records.len(),
        }
    }
}

/// A partition's slot in a fetch response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponseBlock {
    pub err: KafkaCode,
    pub high_watermark: i64,
    pub last_stable_offset: i64,
    pub log_start_offset: i64,
    /// Broker-suggested replica to read from; negative when absent.
    pub preferred_read_replica: i32,
    pub aborted_transactions: Vec<AbortedTransaction>,
    pub records: Vec<Records>,
    /// The record area ended with a truncated container.
    pub partial_trailing: bool,
    /// Offset directly after the last complete container, used to step
    /// over compaction gaps.
    pub records_next_offset: Option<i64>,
}

impl FetchResponseBlock {
    /// An error slot with no records.
    pub fn error(err: KafkaCode) -> Self {
        Self {
            err,
            high_watermark: -1,
            last_stable_offset: -1,
            log_start_offset: -1,
            preferred_read_replica: NO_PREFERRED_REPLICA,
            aborted_transactions: vec![],
            records: vec![],
            partial_trailing: false,
            records_next_offset: None,
        }
    }

    /// A success slot carrying decoded containers.
    pub fn success(high_watermark: i64, records: Vec<Records>) -> Self {
        let records_next_offset = records.iter().rev().find_map(|r| match r {
            Records::Legacy(set) => set.next_offset(),
            Records::Default(batch) => Some(batch.next_offset()),
        });
        Self {
            err: KafkaCode::None,
            high_watermark,
            last_stable_offset: high_watermark,
            log_start_offset: 0,
            preferred_read_replica: NO_PREFERRED_REPLICA,
            aborted_transactions: vec![],
            records,
            partial_trailing: false,
            records_next_offset,
        }
    }

    /// Number of user-visible record slots across all containers.
    pub fn num_records(&self) -> usize {
        self.records.iter().map(Records::num_records).sum()
    }

    /// Aborted transactions ordered by first offset, the order the
    /// filter consumes them in.
    pub fn aborted_transactions_sorted(&self) -> Vec<AbortedTransaction> {
        let mut sorted = self.aborted_transactions.clone();
        sorted.sort_by_key(|t| t.first_offset);
        sorted
    }
}

/// A decoded fetch response.
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub throttle_time_ms: i32,
    /// Response-level error; v7+ only, `None` code otherwise.
    pub err: KafkaCode,
    pub session_id: i32,
    pub blocks: HashMap<String, HashMap<i32, FetchResponseBlock>>,
}

impl FetchResponse {
    /// Look up the block for a partition.
    pub fn block(&self, topic: &str, partition: i32) -> Option<&FetchResponseBlock> {
        self.blocks.get(topic)?.get(&partition)
    }

    /// Insert a block, replacing any previous one for the partition.
    pub fn insert_block(&mut self, topic: &str, partition: i32, block: FetchResponseBlock) {
        self.blocks
            .entry(topic.to_string())
            .or_default()
            .insert(partition, block);
    }

    /// Decode a response body for the given request version.
    pub fn parse(data: Bytes, version: i16) -> Result<Self> {
        let input = NomBytes::new(data.clone());
        match parse_fetch_response(input, version) {
            Ok((_, response)) => Ok(response),
            Err(_) => Err(Error::Parsing(data)),
        }
    }
}

fn parse_fetch_response(s: NomBytes, version: i16) -> IResult<NomBytes, FetchResponse> {
    let (s, throttle_time_ms) = if version >= 1 { be_i32(s)? } else { (s, 0) };
    let (s, err, session_id) = if version >= 7 {
        let (s, code) = be_i16(s)?;
        let (s, session_id) = be_i32(s)?;
        (s, KafkaCode::from_i16(code).unwrap_or(KafkaCode::Unknown), session_id)
    } else {
        (s, KafkaCode::None, FETCH_SESSION_NONE)
    };

    let (s, topics) = counted_array(move |s| parse_topic(s, version))(s)?;

    let mut blocks: HashMap<String, HashMap<i32, FetchResponseBlock>> = HashMap::new();
    for (name, partitions) in topics {
        let entry = blocks.entry(name).or_default();
        for (partition, block) in partitions {
            entry.insert(partition, block);
        }
    }

    Ok((
        s,
        FetchResponse {
            throttle_time_ms,
            err,
            session_id,
            blocks,
        },
    ))
}

type TopicBlocks = (String, Vec<(i32, FetchResponseBlock)>);

fn parse_topic(s: NomBytes, version: i16) -> IResult<NomBytes, TopicBlocks> {
    let (s, name) = string_field(s)?;
    let (s, partitions) = counted_array(move |s| parse_partition(s, version))(s)?;
    Ok((s, (name, partitions)))
}

fn parse_partition(s: NomBytes, version: i16) -> IResult<NomBytes, (i32, FetchResponseBlock)> {
    let (s, partition) = be_i32(s)?;
    let (s, err) = be_i16(s)?;
    let (s, high_watermark) = be_i64(s)?;
    let (s, last_stable_offset) = if version >= 4 {
        be_i64(s)?
    } else {
        (s, high_watermark)
    };
    let (s, log_start_offset) = if version >= 5 { be_i64(s)? } else { (s, -1) };
    let (s, aborted) = if version >= 4 {
        counted_array(parse_aborted_transaction)(s)?
    } else {
        (s, vec![])
    };
    let (s, preferred_read_replica) = if version >= 11 {
        be_i32(s)?
    } else {
        (s, NO_PREFERRED_REPLICA)
    };
    let (s, records_area) = nullable_bytes_field(s)?;

    let (records, partial_trailing, records_next_offset) = match records_area {
        None => (vec![], false, None),
        Some(area) => parse_records_area(&area).map_err(|_| {
            nom::Err::Failure(nom::error::Error::new(
                s.clone(),
                nom::error::ErrorKind::Verify,
            ))
        })?,
    };

    Ok((
        s,
        (
            partition,
            FetchResponseBlock {
                err: KafkaCode::from_i16(err).unwrap_or(KafkaCode::Unknown),
                high_watermark,
                last_stable_offset,
                log_start_offset,
                preferred_read_replica,
                aborted_transactions: aborted,
                records,
                partial_trailing,
                records_next_offset,
            },
        ),
    ))
}

fn parse_aborted_transaction(s: NomBytes) -> IResult<NomBytes, AbortedTransaction> {
    let (s, producer_id) = be_i64(s)?;
    let (s, first_offset) = be_i64(s)?;
    Ok((
        s,
        AbortedTransaction {
            producer_id,
            first_offset,
        },
    ))
}

/// Walk a partition's record area, sniffing each entry's magic byte.
///
/// Returns the decoded containers, whether the area ended mid-container,
/// and the offset after the last complete container.
fn parse_records_area(area: &Bytes) -> Result<(Vec<Records>, bool, Option<i64>)> {
    let mut records = Vec::new();
    let mut partial = false;
    let mut next_offset = None;
    let mut remaining = area.clone();

    while !remaining.is_empty() {
        if remaining.len() <= MAGIC_BYTE_OFFSET {
            partial = true;
            break;
        }

        let magic = remaining[MAGIC_BYTE_OFFSET] as i8;
        if magic < 2 {
            // A legacy message set runs to the end of the area.
            let set = parse_message_set(&remaining, false)?;
            partial = set.partial_trailing;
            if let Some(n) = set.next_offset() {
                next_offset = Some(n);
            }
            records.push(Records::Legacy(set));
            break;
        }

        let declared =
            i32::from_be_bytes([remaining[8], remaining[9], remaining[10], remaining[11]]);
        if declared < 0 {
            return Err(Error::MalformedRecord(format!(
                "record batch with negative length {declared}"
            )));
        }
        let entry_len = 12 + declared as usize;
        if remaining.len() < entry_len {
            partial = true;
            break;
        }

        let batch = parse_record_batch(&remaining.slice(..entry_len))?;
        next_offset = Some(batch.next_offset());
        records.push(Records::Default(batch));
        remaining = remaining.slice(entry_len..);
    }

    Ok((records, partial, next_offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KafkaVersion;

    fn config_for(version: KafkaVersion) -> Config {
        let mut config = Config::default();
        config.version = version;
        config
    }

    #[test]
    fn test_request_version_negotiated_from_config() {
        assert_eq!(FetchRequest::from_config(&config_for(KafkaVersion::V0_9_0)).version, 1);
        assert_eq!(FetchRequest::from_config(&config_for(KafkaVersion::V0_11_0)).version, 5);
        assert_eq!(FetchRequest::from_config(&config_for(KafkaVersion::V2_3_0)).version, 11);
    }

    #[test]
    fn test_request_session_disabled() {
        let request = FetchRequest::from_config(&config_for(KafkaVersion::V1_1_0));
        assert_eq!(request.session_id, 0);
        assert_eq!(request.session_epoch, -1);
    }

    #[test]
    fn test_add_block_preserves_order() {
        let mut request = FetchRequest::from_config(&config_for(KafkaVersion::V0_11_0));
        request.add_block("b-topic", 1, 100, 1024, -1);
        request.add_block("a-topic", 0, 50, 1024, -1);
        request.add_block("b-topic", 0, 10, 1024, -1);

        assert_eq!(request.num_blocks(), 3);
        assert_eq!(request.topics[0].name, "b-topic");
        assert_eq!(request.topics[0].partitions.len(), 2);
        assert_eq!(request.topics[1].name, "a-topic");
        assert_eq!(request.block("b-topic", 0).unwrap().fetch_offset, 10);
        assert!(request.block("b-topic", 9).is_none());
    }

    #[test]
    fn test_encode_v1_layout() {
        let mut request = FetchRequest::from_config(&config_for(KafkaVersion::V0_9_0));
        request.max_wait_ms = 500;
        request.min_bytes = 1;
        request.add_block("t", 0, 42, 1024, -1);

        let bytes = request.encode();
        let mut expected = BytesMut::new();
        expected.put_i32(-1); // replica_id
        expected.put_i32(500);
        expected.put_i32(1);
        expected.put_i32(1); // one topic
        expected.put_i16(1);
        expected.put_slice(b"t");
        expected.put_i32(1); // one partition
        expected.put_i32(0);
        expected.put_i64(42);
        expected.put_i32(1024);
        assert_eq!(&bytes[..], &expected[..]);
    }

    #[test]
    fn test_encode_version_grows_monotonically() {
        // Every added field makes the encoding strictly longer.
        let mut sizes = Vec::new();
        for version in [
            KafkaVersion::V0_9_0,
            KafkaVersion::V0_10_1,
            KafkaVersion::V0_11_0,
            KafkaVersion::V1_1_0,
            KafkaVersion::V2_1_0,
            KafkaVersion::V2_3_0,
        ] {
            let mut request = FetchRequest::from_config(&config_for(version));
            request.add_block("t", 0, 0, 1024, 5);
            sizes.push(request.encode().len());
        }
        for pair in sizes.windows(2) {
            assert!(pair[0] < pair[1], "sizes: {sizes:?}");
        }
    }

    #[test]
    fn test_encode_v11_carries_rack() {
        let mut config = config_for(KafkaVersion::V2_3_0);
        config.rack_id = Some("rack-7".to_string());
        let request = FetchRequest::from_config(&config);
        let bytes = request.encode();
        assert!(bytes.windows(6).any(|w| w == b"rack-7"));
    }

    #[test]
    fn test_rack_dropped_below_v11() {
        let mut config = config_for(KafkaVersion::V2_1_0);
        config.rack_id = Some("rack-7".to_string());
        let request = FetchRequest::from_config(&config);
        assert_eq!(request.rack_id, None);
        let bytes = request.encode();
        assert!(!bytes.windows(6).any(|w| w == b"rack-7"));
    }

    #[test]
    fn test_response_block_lookup() {
        let mut response = FetchResponse::default();
        response.insert_block("t", 0, FetchResponseBlock::success(10, vec![]));
        response.insert_block("t", 1, FetchResponseBlock::error(KafkaCode::NotLeaderForPartition));

        assert_eq!(response.block("t", 0).unwrap().high_watermark, 10);
        assert_eq!(
            response.block("t", 1).unwrap().err,
            KafkaCode::NotLeaderForPartition
        );
        assert!(response.block("t", 2).is_none());
        assert!(response.block("other", 0).is_none());
    }

    #[test]
    fn test_aborted_transactions_sorted() {
        let mut block = FetchResponseBlock::success(100, vec![]);
        block.aborted_transactions = vec![
            AbortedTransaction { producer_id: 2, first_offset: 90 },
            AbortedTransaction { producer_id: 1, first_offset: 10 },
        ];
        let sorted = block.aborted_transactions_sorted();
        assert_eq!(sorted[0].first_offset, 10);
        assert_eq!(sorted[1].first_offset, 90);
    }

    // ========================================================================
    // Response decode
    // ========================================================================

    fn encode_response_v4(records_area: Option<&[u8]>) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_i32(0); // throttle
        buf.put_i32(1); // one topic
        buf.put_i16(5);
        buf.put_slice(b"topic");
        buf.put_i32(1); // one partition
        buf.put_i32(3); // partition index
        buf.put_i16(0); // no error
        buf.put_i64(1000); // high watermark
        buf.put_i64(900); // last stable offset
        buf.put_i32(1); // one aborted transaction
        buf.put_i64(7); // producer id
        buf.put_i64(100); // first offset
        match records_area {
            Some(area) => {
                buf.put_i32(area.len() as i32);
                buf.put_slice(area);
            }
            None => buf.put_i32(-1),
        }
        buf.freeze()
    }

    #[test]
    fn test_parse_response_v4_no_records() {
        let data = encode_response_v4(None);
        let response = FetchResponse::parse(data, 4).unwrap();

        assert_eq!(response.throttle_time_ms, 0);
        let block = response.block("topic", 3).unwrap();
        assert_eq!(block.err, KafkaCode::None);
        assert_eq!(block.high_watermark, 1000);
        assert_eq!(block.last_stable_offset, 900);
        assert_eq!(block.aborted_transactions.len(), 1);
        assert_eq!(block.aborted_transactions[0].producer_id, 7);
        assert!(block.records.is_empty());
        assert!(!block.partial_trailing);
    }

    #[test]
    fn test_parse_response_truncated_is_error() {
        let data = encode_response_v4(None);
        let truncated = data.slice(..data.len() - 6);
        assert!(matches!(
            FetchResponse::parse(truncated, 4),
            Err(Error::Parsing(_))
        ));
    }

    #[test]
    fn test_parse_response_with_partial_batch_area() {
        // A record area holding only a fragment of a batch header.
        let area = vec![0u8; 20];
        let data = encode_response_v4(Some(&area));
        let response = FetchResponse::parse(data, 4).unwrap();
        let block = response.block("topic", 3).unwrap();
        assert!(block.partial_trailing);
        assert!(block.records.is_empty());
    }

    #[test]
    fn test_parse_response_v7_session_fields() {
        let mut buf = BytesMut::new();
        buf.put_i32(25); // throttle
        buf.put_i16(0); // response error
        buf.put_i32(99); // session id
        buf.put_i32(0); // no topics
        let response = FetchResponse::parse(buf.freeze(), 7).unwrap();
        assert_eq!(response.throttle_time_ms, 25);
        assert_eq!(response.session_id, 99);
        assert!(response.blocks.is_empty());
    }
}
