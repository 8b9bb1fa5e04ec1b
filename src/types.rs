//! Type-safe wrappers for Kafka protocol primitives.
//!
//! These newtypes provide type safety to prevent mixing up different
//! integer types that have the same underlying representation but
//! different semantic meanings.

use bytes::BufMut;
use std::fmt;

use crate::encode::WireEncode;

/// A Kafka message offset within a partition.
///
/// Offsets are 64-bit signed integers that represent the position
/// of a message within a partition's log.
///
/// # Special Values
///
/// Kafka uses negative values for special offset semantics:
/// - `-1` ([`Offset::NEWEST`]): resolve to the end of the log, i.e. the
///   offset of the message that will be produced next.
/// - `-2` ([`Offset::OLDEST`]): resolve to the oldest available message.
///
/// Special offsets are resolved against the broker when a partition
/// subscription is created; an absolute offset must fall inside
/// `[log start, log end]` or the subscription is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Offset(pub i64);

impl Offset {
    /// Special offset meaning "latest message" (end of log).
    pub const NEWEST: Self = Offset(-1);

    /// Special offset meaning "earliest available message".
    pub const OLDEST: Self = Offset(-2);

    /// Create a new offset from a raw value.
    #[inline]
    pub const fn new(value: i64) -> Self {
        Offset(value)
    }

    /// Get the raw i64 value.
    #[inline]
    pub const fn value(self) -> i64 {
        self.0
    }

    /// Check if this is an absolute (non-negative) offset.
    #[inline]
    pub const fn is_absolute(self) -> bool {
        self.0 >= 0
    }

    /// Check if this is a special offset ([`Offset::NEWEST`] or
    /// [`Offset::OLDEST`]).
    #[inline]
    pub const fn is_special(self) -> bool {
        self.0 < 0
    }
}

impl From<i64> for Offset {
    fn from(value: i64) -> Self {
        Offset(value)
    }
}

impl From<Offset> for i64 {
    fn from(offset: Offset) -> Self {
        offset.0
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl WireEncode for Offset {
    fn put<B: BufMut>(&self, out: &mut B) {
        self.0.put(out);
    }
}

/// A Kafka broker identifier.
///
/// Broker IDs are 32-bit signed integers that uniquely identify
/// brokers within a Kafka cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BrokerId(pub i32);

impl BrokerId {
    /// Invalid broker ID, typically used to indicate no leader.
    pub const INVALID: Self = BrokerId(-1);

    /// Create a new broker ID from a raw value.
    #[inline]
    pub const fn new(value: i32) -> Self {
        BrokerId(value)
    }

    /// Get the raw i32 value.
    #[inline]
    pub const fn value(self) -> i32 {
        self.0
    }

    /// Check if this is a valid (non-negative) broker ID.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl From<i32> for BrokerId {
    fn from(value: i32) -> Self {
        BrokerId(value)
    }
}

impl From<BrokerId> for i32 {
    fn from(id: BrokerId) -> Self {
        id.0
    }
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A (topic, partition) pair, the unit at which the consumer keeps a
/// distinct cursor, fetch size, and lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}
