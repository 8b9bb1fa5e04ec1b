//! Centralized protocol and configuration constants.
//!
//! This module consolidates the magic numbers and protocol constants used
//! throughout the consumer. Having them in one place makes it easier to:
//!
//! - Understand the protocol constraints
//! - Update values consistently
//! - Document the rationale for each constant
//!
//! # Categories
//!
//! - **Record Batch Constants**: byte layout of the v2 record batch header
//! - **Legacy Message Constants**: byte layout of the v0/v1 message sets
//! - **Fetch Constants**: defaults for the fetch pipeline
//! - **Scheduling Constants**: timing used by the consumer tasks

use std::time::Duration;

// =============================================================================
// Record Batch Constants (magic 2, Kafka Wire Protocol)
// =============================================================================

/// Fixed header size of a v2 record batch: everything up to and
/// including the record count, before the first record begins. An entry
/// shorter than this cannot be a complete batch. The field-by-field
/// layout is documented in [`crate::protocol::record`].
pub const MIN_BATCH_HEADER_SIZE: usize = 61;

/// Offset of the magic byte, counted from the start of a record set entry.
///
/// Both legacy message sets and v2 record batches place the magic byte at
/// the same position (after the 8-byte offset, 4-byte length, and a 4-byte
/// field that is the CRC for legacy and the partition leader epoch for v2),
/// which is what makes format sniffing possible.
pub const MAGIC_BYTE_OFFSET: usize = 16;

/// First checksummed byte of a v2 batch (the attributes field). The
/// fields before it are either rewritable by the broker or are the
/// checksum itself.
pub const BATCH_CRC_DATA_START: usize = 21;

// =============================================================================
// Legacy Message Constants (magic 0 and 1)
// =============================================================================

/// Bytes preceding each message in a legacy message set:
/// offset (8 bytes) + message size (4 bytes).
pub const LEGACY_MESSAGE_SET_HEADER_SIZE: usize = 12;

/// Fixed fields of a magic-0 message: crc (4) + magic (1) + attributes (1).
pub const LEGACY_V0_HEADER_SIZE: usize = 6;

/// A magic-1 message adds a timestamp (8 bytes) after the attributes.
pub const LEGACY_V1_HEADER_SIZE: usize = 14;

// =============================================================================
// Fetch Constants
// =============================================================================

/// Fewest bytes the broker should accumulate before answering a fetch.
pub const DEFAULT_FETCH_MIN_BYTES: i32 = 1;

/// Default per-partition fetch size hint (1 MB).
///
/// The fetch pipeline doubles this when it encounters a partial trailing
/// message too large to fit, and resets it once records flow again.
pub const DEFAULT_FETCH_BYTES: i32 = 1024 * 1024;

/// Upper bound for a whole fetch response (100 MB).
///
/// Sent as the request-level `max_bytes` on protocol versions that support
/// it. It prevents a single response from exhausting client memory.
pub const MAX_RESPONSE_BYTES: i32 = 100 * 1024 * 1024;

/// Maximum allowed array size when parsing fetch responses.
///
/// This prevents memory exhaustion from malformed responses that claim
/// to have billions of elements. 100,000 is generous but bounded.
pub const MAX_PROTOCOL_ARRAY_SIZE: i32 = 100_000;

/// Sentinel for "no preferred read replica, consume from the leader".
pub const NO_PREFERRED_REPLICA: i32 = -1;

/// Sentinel for "leader epoch unknown"; brokers skip epoch fencing for it.
pub const NO_LEADER_EPOCH: i32 = -1;

/// Fetch-session id sent on protocol v7+.
///
/// Incremental fetch sessions are not implemented; id 0 with epoch -1
/// tells the broker not to allocate one.
pub const FETCH_SESSION_NONE: i32 = 0;

/// Fetch-session epoch sent alongside [`FETCH_SESSION_NONE`].
pub const FETCH_SESSION_EPOCH_NONE: i32 = -1;

// =============================================================================
// Scheduling Constants
// =============================================================================

/// How long a broker multiplexer collects additional partition
/// subscriptions before publishing a coalesced batch.
pub const SUBSCRIPTION_BATCH_WINDOW: Duration = Duration::from_millis(100);

/// Nap taken by an idle broker multiplexer with nothing to fetch.
pub const IDLE_SLEEP: Duration = Duration::from_millis(100);
