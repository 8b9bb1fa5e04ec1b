//! Consumer configuration.
//!
//! [`Config`] collects every tunable of the fetch pipeline with defaults
//! that are safe for production use. Construct one, adjust the fields you
//! care about, and run [`Config::validate`] (the consumer does this for
//! you at construction time):
//!
//! ```rust
//! use gregor::config::{Config, IsolationLevel, KafkaVersion};
//!
//! let mut config = Config::default();
//! config.version = KafkaVersion::V2_3_0;
//! config.isolation_level = IsolationLevel::ReadCommitted;
//! config.return_errors = true;
//! assert!(config.validate().is_ok());
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::constants::{DEFAULT_FETCH_BYTES, DEFAULT_FETCH_MIN_BYTES};
use crate::consumer::ConsumerRecord;

/// Isolation level applied when reading transactional topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Deliver every non-control record, including records from
    /// transactions that later aborted.
    #[default]
    ReadUncommitted = 0,
    /// Additionally drop records belonging to aborted transactions.
    ReadCommitted = 1,
}

/// Minimum broker release the client may assume when negotiating
/// protocol versions.
///
/// The fetch request version is selected from this value; see the
/// version table in [`crate::protocol::versions`]. Ordering follows the
/// release order, so `>=` comparisons express "broker is at least".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[allow(non_camel_case_types)]
pub enum KafkaVersion {
    V0_9_0,
    V0_10_0,
    V0_10_1,
    V0_11_0,
    V1_0_0,
    V1_1_0,
    V2_0_0,
    V2_1_0,
    V2_3_0,
}

impl KafkaVersion {
    /// Check whether this version is at least `other`.
    #[inline]
    pub fn is_at_least(self, other: KafkaVersion) -> bool {
        self >= other
    }
}

impl fmt::Display for KafkaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KafkaVersion::V0_9_0 => "0.9.0",
            KafkaVersion::V0_10_0 => "0.10.0",
            KafkaVersion::V0_10_1 => "0.10.1",
            KafkaVersion::V0_11_0 => "0.11.0",
            KafkaVersion::V1_0_0 => "1.0.0",
            KafkaVersion::V1_1_0 => "1.1.0",
            KafkaVersion::V2_0_0 => "2.0.0",
            KafkaVersion::V2_1_0 => "2.1.0",
            KafkaVersion::V2_3_0 => "2.3.0",
        };
        f.write_str(s)
    }
}

/// A hook invoked on every record immediately before it is handed to the
/// user.
///
/// Interceptors may rewrite the record in place (e.g. decrypt the value,
/// strip internal headers). A panicking interceptor is isolated and
/// logged; it never takes the delivery task down.
pub trait ConsumerInterceptor: Send + Sync {
    fn on_consume(&self, record: &mut ConsumerRecord);
}

/// Signature for a user-supplied backoff schedule, called with the number
/// of consecutive failed attempts for the partition.
pub type BackoffFn = Arc<dyn Fn(i32) -> Duration + Send + Sync>;

/// Retry behavior for re-routing a partition after a failure.
#[derive(Clone)]
pub struct RetryConfig {
    /// Fixed delay before re-resolving the partition's broker.
    ///
    /// Default: 2 seconds.
    pub backoff: Duration,

    /// Optional schedule computed from the consecutive-failure count;
    /// overrides `backoff` when set. The count resets to zero on any
    /// successful fetch.
    pub backoff_fn: Option<BackoffFn>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(2),
            backoff_fn: None,
        }
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("backoff", &self.backoff)
            .field("backoff_fn", &self.backoff_fn.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Per-partition fetch sizing.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Fewest bytes the broker should accumulate before answering.
    ///
    /// Default: 1. Raising this trades latency for fewer round trips.
    pub min: i32,

    /// Per-partition byte hint sent with each fetch.
    ///
    /// Default: 1 MB. Grown automatically (doubling) when a message does
    /// not fit, and reset once records flow again.
    pub default: i32,

    /// Hard ceiling for the per-partition hint; 0 means unbounded.
    ///
    /// When the hint has grown to this ceiling and a message still does
    /// not fit, the consumer reports the message as too large and skips
    /// past it rather than stalling.
    pub max: i32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            min: DEFAULT_FETCH_MIN_BYTES,
            default: DEFAULT_FETCH_BYTES,
            max: 0,
        }
    }
}

/// Consumer configuration.
#[derive(Clone)]
pub struct Config {
    /// Fetch sizing policy.
    pub fetch: FetchConfig,

    /// Longest the broker may hold a fetch open waiting for `fetch.min`
    /// bytes.
    ///
    /// Default: 500 ms.
    pub max_wait_time: Duration,

    /// Budget for delivering a single record to the user before the
    /// partition is considered stuck and is re-routed.
    ///
    /// Default: 100 ms.
    pub max_processing_time: Duration,

    /// Retry behavior on partition re-dispatch.
    pub retry: RetryConfig,

    /// Isolation level for transactional topics.
    pub isolation_level: IsolationLevel,

    /// Rack of this client, sent on fetch v11+ so the broker can steer
    /// the client towards a nearby replica.
    pub rack_id: Option<String>,

    /// Minimum broker release assumed for protocol negotiation.
    ///
    /// Default: 0.9.0, the most conservative choice.
    pub version: KafkaVersion,

    /// Deliver errors on the error channel instead of only logging them.
    ///
    /// Default: false.
    pub return_errors: bool,

    /// Capacity of the per-partition message and error channels.
    ///
    /// Default: 256.
    pub channel_buffer_size: usize,

    /// Hooks applied to each record before delivery, in order.
    pub interceptors: Vec<Arc<dyn ConsumerInterceptor>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fetch: FetchConfig::default(),
            max_wait_time: Duration::from_millis(500),
            max_processing_time: Duration::from_millis(100),
            retry: RetryConfig::default(),
            isolation_level: IsolationLevel::default(),
            rack_id: None,
            version: KafkaVersion::V0_9_0,
            return_errors: false,
            channel_buffer_size: 256,
            interceptors: Vec::new(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("fetch", &self.fetch)
            .field("max_wait_time", &self.max_wait_time)
            .field("max_processing_time", &self.max_processing_time)
            .field("retry", &self.retry)
            .field("isolation_level", &self.isolation_level)
            .field("rack_id", &self.rack_id)
            .field("version", &self.version)
            .field("return_errors", &self.return_errors)
            .field("channel_buffer_size", &self.channel_buffer_size)
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

impl Config {
    /// Validate the configuration, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.fetch.min < 1 {
            problems.push("fetch.min must be at least 1".to_string());
        }
        if self.fetch.default < 1 {
            problems.push("fetch.default must be at least 1".to_string());
        }
        if self.fetch.max < 0 {
            problems.push("fetch.max must not be negative".to_string());
        }
        if self.fetch.max > 0 && self.fetch.max < self.fetch.default {
            problems.push("fetch.max must be at least fetch.default".to_string());
        }
        if self.max_wait_time < Duration::from_millis(1) {
            problems.push("max_wait_time must be at least 1ms".to_string());
        }
        if self.max_processing_time < Duration::from_millis(1) {
            problems.push("max_processing_time must be at least 1ms".to_string());
        }
        if self.retry.backoff.is_zero() && self.retry.backoff_fn.is_none() {
            problems.push("retry.backoff must be non-zero or retry.backoff_fn set".to_string());
        }
        if self.channel_buffer_size == 0 {
            problems.push("channel_buffer_size must be at least 1".to_string());
        }
        if self.isolation_level == IsolationLevel::ReadCommitted
            && !self.version.is_at_least(KafkaVersion::V0_11_0)
        {
            problems.push(
                "isolation_level ReadCommitted requires version at least 0.11.0".to_string(),
            );
        }
        if self.rack_id.is_some() && !self.version.is_at_least(KafkaVersion::V2_3_0) {
            problems.push("rack_id requires version at least 2.3.0".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}
