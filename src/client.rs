//! Ports to the world outside the fetch pipeline.
//!
//! The consumer core is transport-agnostic: cluster metadata and the
//! fetch RPC are reached through the two traits below, injected at
//! construction. Production implementations wrap a real client stack;
//! tests wire in scripted fakes.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::fetch::{FetchRequest, FetchResponse};
use crate::types::{BrokerId, Offset};

/// A live connection to a single broker.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// The broker's id within the cluster.
    fn id(&self) -> BrokerId;

    /// Issue one fetch round trip.
    ///
    /// Transport-level timeouts are this implementation's concern; the
    /// pipeline treats any error as a broken connection and re-routes
    /// every affected partition.
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse>;

    /// Tear the connection down. Called when the pipeline abandons the
    /// broker after a transport failure.
    async fn close(&self) -> Result<()>;
}

/// Cluster metadata: leadership, replica lookup, and log bounds.
#[async_trait]
pub trait MetadataClient: Send + Sync {
    /// Refresh cached metadata for a topic.
    async fn refresh_metadata(&self, topic: &str) -> Result<()>;

    /// The current leader for a partition and its leader epoch.
    async fn leader_and_epoch(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<(Arc<dyn BrokerLink>, i32)>;

    /// Open (or reuse) a connection to a specific broker, as named by a
    /// preferred-read-replica hint.
    async fn broker_by_id(&self, id: BrokerId) -> Result<Arc<dyn BrokerLink>>;

    /// Resolve a log bound: [`Offset::NEWEST`] for the log end,
    /// [`Offset::OLDEST`] for the log start.
    async fn get_offset(&self, topic: &str, partition: i32, at: Offset) -> Result<i64>;

    /// All known topics.
    async fn topics(&self) -> Result<Vec<String>>;

    /// The partition ids of a topic, sorted.
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>>;
}
