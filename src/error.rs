//! Crate & protocol level errors.
//!
//! # Error Hierarchy
//!
//! - [`Error`]: everything that can go wrong inside the fetch pipeline,
//!   from transport failures to malformed record containers. Broker-side
//!   error codes are wrapped as [`Error::Kafka`].
//! - [`KafkaCode`]: wire protocol error codes as reported by the broker.
//! - [`ConsumerError`]: an [`Error`] tagged with the (topic, partition) it
//!   occurred on, which is what the user receives on the error channel.
//! - [`ConsumerErrors`]: a batch of [`ConsumerError`]s, returned by the
//!   draining close so callers do not have to empty the error channel by
//!   hand.
//!
//! # Classification
//!
//! The broker multiplexer sorts per-partition outcomes into three buckets:
//! fatal for the subscription (offset out of range), silently retriable
//! (leadership churn, see [`KafkaCode::is_silently_retriable`]), and
//! user-visible but recoverable (everything else). [`Error::TimedOut`] is
//! internal bookkeeping for a slow consumer and is never surfaced.

use bytes::Bytes;
use num_derive::FromPrimitive;
use std::{fmt, io, result};
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

/// Errors produced by the consumer core.
#[derive(Clone, Debug, ThisError)]
pub enum Error {
    /// An error in the network.
    #[error("IO error: {0:?}")]
    Io(io::ErrorKind),

    /// Could not parse the data.
    #[error("Parsing error: invalid data ({} bytes)", .0.len())]
    Parsing(Bytes),

    /// A record container failed CRC validation or carried an impossible
    /// layout.
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    /// The broker does not speak a compression codec we understand.
    #[error("Unsupported compression codec: {0}")]
    UnsupportedCodec(i8),

    /// An error code reported by the broker for a partition.
    #[error("Kafka server error: {0:?}")]
    Kafka(KafkaCode),

    /// A single message is larger than the largest fetch size we are
    /// permitted to request; the offender is skipped.
    #[error("Message is larger than the maximum fetch size")]
    MessageTooLarge,

    /// The broker answered a fetch without a block for a partition we
    /// asked about.
    #[error("Response did not contain the expected topic/partition block")]
    IncompleteResponse,

    /// Delivering a message to the user did not complete within the
    /// processing-time budget. Internal; never sent to the user.
    #[error("Timed out feeding messages to the user")]
    TimedOut,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::Io(a), Error::Io(b)) => a == b,
            (Error::Parsing(a), Error::Parsing(b)) => a == b,
            (Error::MalformedRecord(a), Error::MalformedRecord(b)) => a == b,
            (Error::UnsupportedCodec(a), Error::UnsupportedCodec(b)) => a == b,
            (Error::Kafka(a), Error::Kafka(b)) => a == b,
            (Error::MessageTooLarge, Error::MessageTooLarge) => true,
            (Error::IncompleteResponse, Error::IncompleteResponse) => true,
            (Error::TimedOut, Error::TimedOut) => true,
            (Error::Config(a), Error::Config(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.kind())
    }
}

/// Various errors reported by a remote Kafka server.
/// See also [Kafka Errors](http://kafka.apache.org/protocol.html)
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, Default)]
pub enum KafkaCode {
    /// An unexpected server error
    Unknown = -1,
    #[default]
    None = 0,
    /// The requested offset is outside the range of offsets
    /// maintained by the server for the given topic/partition
    OffsetOutOfRange = 1,
    /// This indicates that a message contents does not match its CRC
    CorruptMessage = 2,
    /// This request is for a topic or partition that does not exist
    /// on this broker.
    UnknownTopicOrPartition = 3,
    /// The message has a negative size
    InvalidMessageSize = 4,
    /// This error is thrown if we are in the middle of a leadership
    /// election and there is currently no leader for this partition
    /// and hence it is unavailable for writes.
    LeaderNotAvailable = 5,
    /// This error is thrown if the client attempts to send messages
    /// to a replica that is not the leader for some partition. It
    /// indicates that the clients metadata is out of date.
    NotLeaderForPartition = 6,
    /// This error is thrown if the request exceeds the user-specified
    /// time limit in the request.
    RequestTimedOut = 7,
    /// This is not a client facing error and is used mostly by tools
    /// when a broker is not alive.
    BrokerNotAvailable = 8,
    /// If replica is expected on a broker, but is not (this can be
    /// safely ignored).
    ReplicaNotAvailable = 9,
    /// The server has a configurable maximum message size to avoid
    /// unbounded memory allocation. This error is thrown if the
    /// client attempt to produce a message larger than this maximum.
    MessageSizeTooLarge = 10,
    /// Internal error code for broker-to-broker communication.
    StaleControllerEpoch = 11,
    /// If you specify a string larger than configured maximum for
    /// offset metadata
    OffsetMetadataTooLarge = 12,
    /// The server disconnected before a response was received.
    NetworkException = 13,
    /// For a request which attempts to access an invalid topic
    /// (e.g. one which has an illegal name), or if an attempt is made
    /// to write to an internal topic (such as the consumer offsets
    /// topic).
    InvalidTopic = 17,
    /// If a message batch in a produce request exceeds the maximum
    /// configured segment size.
    RecordListTooLarge = 18,
    /// The timestamp of the message is out of acceptable range.
    InvalidTimestamp = 32,
    /// The version of API is not supported.
    UnsupportedVersion = 35,
    /// The message format version on the broker does not support the request.
    UnsupportedForMessageFormat = 43,
    /// The broker received an out-of-order sequence number.
    OutOfOrderSequenceNumber = 45,
    /// The broker received a duplicate sequence number.
    DuplicateSequenceNumber = 46,
    /// The producer attempted an operation with an old epoch.
    InvalidProducerEpoch = 47,
    /// The requested operation is not permitted in the current
    /// transactional state.
    InvalidTxnState = 48,
    /// The fetcher's leader epoch is older than the one on the broker;
    /// metadata is stale.
    FencedLeaderEpoch = 74,
    /// The fetcher's leader epoch is newer than the one on the broker;
    /// the broker has not caught up with the leadership change.
    UnknownLeaderEpoch = 75,
    /// The requested compression codec is not available on this broker.
    UnsupportedCompressionType = 76,
}

impl KafkaCode {
    /// Codes caused by leadership churn or stale metadata. They are
    /// expected during normal cluster operation, so the subscription is
    /// re-routed after a backoff without telling the user.
    pub fn is_silently_retriable(self) -> bool {
        matches!(
            self,
            KafkaCode::UnknownTopicOrPartition
                | KafkaCode::NotLeaderForPartition
                | KafkaCode::LeaderNotAvailable
                | KafkaCode::ReplicaNotAvailable
                | KafkaCode::FencedLeaderEpoch
                | KafkaCode::UnknownLeaderEpoch
        )
    }
}

/// An [`Error`] tagged with the topic and partition it occurred on.
///
/// This is what arrives on a partition consumer's error channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerError {
    pub topic: String,
    pub partition: i32,
    pub err: Error,
}

impl fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "error while consuming {}/{}: {}",
            self.topic, self.partition, self.err
        )
    }
}

impl std::error::Error for ConsumerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.err)
    }
}

/// A batch of [`ConsumerError`]s, harvested while draining a partition
/// consumer during close.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsumerErrors(pub Vec<ConsumerError>);

impl ConsumerErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for ConsumerErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors while consuming", self.0.len())
    }
}

impl std::error::Error for ConsumerErrors {}

impl IntoIterator for ConsumerErrors {
    type Item = ConsumerError;
    type IntoIter = std::vec::IntoIter<ConsumerError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn test_error_io_error() {
        let err = Error::Io(io::ErrorKind::ConnectionRefused);
        assert_eq!(err, Error::Io(io::ErrorKind::ConnectionRefused));
    }

    #[test]
    fn test_error_parsing_error() {
        let data = Bytes::from("bad data");
        let err = Error::Parsing(data.clone());
        assert_eq!(err, Error::Parsing(data));
    }

    #[test]
    fn test_error_display() {
        let err = Error::MalformedRecord("crc mismatch".to_string());
        let display = format!("{}", err);
        assert!(display.contains("Malformed record"));
        assert!(display.contains("crc mismatch"));
    }

    #[test]
    fn test_error_is_std_error() {
        let err: Box<dyn std::error::Error> = Box::new(Error::MessageTooLarge);
        assert!(err.to_string().contains("maximum fetch size"));
    }

    #[test]
    fn test_kafka_code_from_primitive() {
        assert_eq!(KafkaCode::from_i16(-1), Some(KafkaCode::Unknown));
        assert_eq!(KafkaCode::from_i16(0), Some(KafkaCode::None));
        assert_eq!(KafkaCode::from_i16(1), Some(KafkaCode::OffsetOutOfRange));
        assert_eq!(
            KafkaCode::from_i16(3),
            Some(KafkaCode::UnknownTopicOrPartition)
        );
        assert_eq!(KafkaCode::from_i16(6), Some(KafkaCode::NotLeaderForPartition));
        assert_eq!(KafkaCode::from_i16(74), Some(KafkaCode::FencedLeaderEpoch));
        assert_eq!(KafkaCode::from_i16(75), Some(KafkaCode::UnknownLeaderEpoch));
    }

    #[test]
    fn test_kafka_code_unknown_value() {
        // Values not in the enum should return None
        assert_eq!(KafkaCode::from_i16(999), None);
        assert_eq!(KafkaCode::from_i16(-100), None);
    }

    #[test]
    fn test_kafka_code_values() {
        assert_eq!(KafkaCode::Unknown as i16, -1);
        assert_eq!(KafkaCode::None as i16, 0);
        assert_eq!(KafkaCode::OffsetOutOfRange as i16, 1);
        assert_eq!(KafkaCode::CorruptMessage as i16, 2);
        assert_eq!(KafkaCode::UnknownTopicOrPartition as i16, 3);
        assert_eq!(KafkaCode::LeaderNotAvailable as i16, 5);
        assert_eq!(KafkaCode::NotLeaderForPartition as i16, 6);
        assert_eq!(KafkaCode::ReplicaNotAvailable as i16, 9);
        assert_eq!(KafkaCode::FencedLeaderEpoch as i16, 74);
        assert_eq!(KafkaCode::UnknownLeaderEpoch as i16, 75);
    }

    #[test]
    fn test_silently_retriable_codes() {
        for code in [
            KafkaCode::UnknownTopicOrPartition,
            KafkaCode::NotLeaderForPartition,
            KafkaCode::LeaderNotAvailable,
            KafkaCode::ReplicaNotAvailable,
            KafkaCode::FencedLeaderEpoch,
            KafkaCode::UnknownLeaderEpoch,
        ] {
            assert!(code.is_silently_retriable(), "{:?}", code);
        }

        assert!(!KafkaCode::OffsetOutOfRange.is_silently_retriable());
        assert!(!KafkaCode::CorruptMessage.is_silently_retriable());
        assert!(!KafkaCode::None.is_silently_retriable());
    }

    #[test]
    fn test_consumer_error_display() {
        let err = ConsumerError {
            topic: "events".to_string(),
            partition: 2,
            err: Error::Kafka(KafkaCode::OffsetOutOfRange),
        };
        let display = format!("{}", err);
        assert!(display.contains("events/2"));
        assert!(display.contains("OffsetOutOfRange"));
    }

    #[test]
    fn test_consumer_errors_aggregate() {
        let errors = ConsumerErrors(vec![
            ConsumerError {
                topic: "a".to_string(),
                partition: 0,
                err: Error::MessageTooLarge,
            },
            ConsumerError {
                topic: "a".to_string(),
                partition: 1,
                err: Error::IncompleteResponse,
            },
        ]);
        assert_eq!(errors.len(), 2);
        assert!(!errors.is_empty());
        assert_eq!(format!("{}", errors), "2 errors while consuming");

        let collected: Vec<_> = errors.into_iter().collect();
        assert_eq!(collected.len(), 2);
    }

    #[test]
    fn test_error_clone() {
        let err = Error::Config("bad fetch sizes".to_string());
        let cloned = err.clone();
        assert_eq!(err, cloned);
    }
}
