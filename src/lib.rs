//! # Gregor
//! Rust-native Kafka protocol consumer client core.
//!
//! This crate implements the multi-partition fetch pipeline of a Kafka
//! consumer: it turns per-partition subscriptions into correctly-ordered,
//! deduplicated, transactionally-filtered streams of records, while
//! multiplexing fetches across brokers, following leadership changes,
//! preferring read replicas, applying backpressure, and recovering from
//! partial failures. This is pure Rust all the way down; meaning memory
//! safety, safe concurrency, low resource usage, and speed.
//!
//! # Goals
//! - Easy to understand code
//! - Leverage best in class libraries such as [Tokio](https://tokio.rs/), [Nom](https://docs.rs/nom/latest/nom/)
//! - Decode every record container the protocol ever shipped: legacy
//!   message sets and record batches, across four compression codecs
//! - Be a building block for full Kafka client stacks
//!
//! ## Getting started
//!
//! The pipeline talks to a cluster through two traits:
//! [`MetadataClient`](client::MetadataClient) for leadership and log
//! bounds, and [`BrokerLink`](client::BrokerLink) for the fetch RPC.
//! Implement them over your transport and hand them to a
//! [`Consumer`](consumer::Consumer):
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gregor::config::Config;
//! use gregor::consumer::Consumer;
//! use gregor::types::Offset;
//!
//! # async fn example(metadata: Arc<dyn gregor::client::MetadataClient>) -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = Config::default();
//! config.return_errors = true;
//!
//! let consumer = Consumer::new(metadata, config)?;
//! let mut partition = consumer.consume_partition("events", 0, Offset::OLDEST).await?;
//!
//! while let Some(record) = partition.recv().await {
//!     println!("{}/{}@{}", record.topic, record.partition, record.offset);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! A `PartitionConsumer` only stops itself when the broker reports the
//! consumed offset as out of range; every other failure is retried with
//! backoff. Call `close()` (or `async_close()`) on each partition before
//! dropping the `Consumer`.
//!
//! ## Resources
//! - [Kafka Protocol Spec](https://kafka.apache.org/protocol.html)
//! - [Confluence Docs](https://cwiki.apache.org/confluence/display/KAFKA/A+Guide+To+The+Kafka+Protocol)

#![forbid(unsafe_code)]

pub mod client;
pub mod compression;
pub mod config;
pub mod constants;
pub mod consumer;
pub mod encode;
pub mod error;
mod parser;
pub mod protocol;
pub mod types;

pub mod prelude {
    //! Main exports of the consumer pipeline.
    pub use crate::client::{BrokerLink, MetadataClient};
    pub use crate::config::{Config, IsolationLevel, KafkaVersion};
    pub use crate::consumer::{Consumer, ConsumerRecord, PartitionConsumer};
    pub use crate::error::{ConsumerError, ConsumerErrors, Error, KafkaCode, Result};
    pub use crate::protocol::fetch::{FetchRequest, FetchResponse};
    pub use crate::types::{BrokerId, Offset, TopicPartition};

    pub use bytes;
}
