//! The multi-partition fetch pipeline.
//!
//! [`Consumer`] is the factory and registry: it creates one
//! [`PartitionConsumer`] per subscribed (topic, partition), routes each to
//! a per-broker multiplexer, and keeps the multiplexers alive with a
//! reference count so partitions sharing a broker share one connection
//! and one in-flight fetch.
//!
//! ```text
//! user ──consume_partition──▶ PartitionConsumer (dispatcher + feeder)
//!                              │ routed by leader / preferred replica
//!                              ▼
//!                             BrokerConsumer (manager + consumer)
//!                              │ one coalesced fetch per cycle
//!                              ▼
//!                             broker
//! ```
//!
//! Delivery guarantees: within a partition, records reach the user in
//! strict offset order with no gaps at or above the requested start
//! offset; across partitions nothing is implied. Delivery is
//! at-least-once, with aborted transactions filtered when the isolation
//! level asks for it.

mod broker;
mod partition;

pub use partition::PartitionConsumer;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use crate::client::{BrokerLink, MetadataClient};
use crate::config::Config;
use crate::consumer::broker::{BrokerHandle, spawn_broker_consumer};
use crate::consumer::partition::PartitionInner;
use crate::error::{Error, Result};
use crate::protocol::record::RecordHeader;
use crate::types::{BrokerId, Offset};

/// A record as delivered to the application. Immutable once delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Record timestamp in milliseconds; -1 when the broker predates
    /// timestamps.
    pub timestamp: i64,
    /// For legacy compressed messages, the timestamp of the outer
    /// wrapper block; -1 otherwise.
    pub block_timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<RecordHeader>,
}

struct BrokerEntry {
    handle: Arc<BrokerHandle>,
    refs: usize,
}

#[derive(Default)]
struct Registry {
    children: HashMap<String, HashMap<i32, Arc<PartitionInner>>>,
    broker_consumers: HashMap<BrokerId, BrokerEntry>,
}

/// Shared state behind a [`Consumer`].
pub(crate) struct ConsumerInner {
    pub(crate) config: Arc<Config>,
    pub(crate) metadata: Arc<dyn MetadataClient>,
    registry: Mutex<Registry>,
}

impl ConsumerInner {
    fn add_child(&self, child: &Arc<PartitionInner>) -> Result<()> {
        let mut registry = self.registry.lock();
        let topic_children = registry.children.entry(child.topic.clone()).or_default();
        if topic_children.contains_key(&child.partition) {
            return Err(Error::Config(
                "that topic/partition is already being consumed".to_string(),
            ));
        }
        topic_children.insert(child.partition, child.clone());
        Ok(())
    }

    pub(crate) fn remove_child(&self, topic: &str, partition: i32) {
        let mut registry = self.registry.lock();
        if let Some(topic_children) = registry.children.get_mut(topic) {
            topic_children.remove(&partition);
            if topic_children.is_empty() {
                registry.children.remove(topic);
            }
        }
    }

    /// Acquire the multiplexer for a broker, starting one if the broker
    /// is not yet served, and take a reference on it.
    pub(crate) fn ref_broker_consumer(
        this: &Arc<Self>,
        broker: Arc<dyn BrokerLink>,
    ) -> Arc<BrokerHandle> {
        let mut registry = this.registry.lock();
        let entry = registry
            .broker_consumers
            .entry(broker.id())
            .or_insert_with(|| BrokerEntry {
                handle: spawn_broker_consumer(this.clone(), broker),
                refs: 0,
            });
        entry.refs += 1;
        entry.handle.clone()
    }

    /// Release a reference. When the count reaches zero the registry
    /// entry is removed and, once every subscription has dropped its
    /// handle, the multiplexer's input closes and its tasks exit.
    pub(crate) fn unref_broker_consumer(&self, handle: &Arc<BrokerHandle>) {
        let mut registry = self.registry.lock();
        let id = handle.id();
        if let Some(entry) = registry.broker_consumers.get_mut(&id) {
            if !Arc::ptr_eq(&entry.handle, handle) {
                return;
            }
            entry.refs -= 1;
            if entry.refs == 0 {
                registry.broker_consumers.remove(&id);
            }
        }
    }

    /// Drop a multiplexer that aborted, so the next dispatch starts a
    /// fresh one. References held by subscriptions stay valid; they are
    /// released as each one re-routes.
    pub(crate) fn abandon_broker_consumer(&self, broker: &Arc<dyn BrokerLink>) {
        let mut registry = self.registry.lock();
        let id = broker.id();
        if let Some(entry) = registry.broker_consumers.get(&id) {
            if Arc::ptr_eq(&entry.handle.broker, broker) {
                registry.broker_consumers.remove(&id);
            }
        }
    }

    fn child(&self, topic: &str, partition: i32) -> Option<Arc<PartitionInner>> {
        self.registry.lock().children.get(topic)?.get(&partition).cloned()
    }

    fn for_each_child(&self, mut f: impl FnMut(&Arc<PartitionInner>)) {
        let registry = self.registry.lock();
        for topic_children in registry.children.values() {
            for child in topic_children.values() {
                f(child);
            }
        }
    }
}

/// Manages [`PartitionConsumer`]s which consume records from brokers.
///
/// Cheap to share behind its internal `Arc`. Close every
/// `PartitionConsumer` before letting the `Consumer` go out of scope;
/// dropping it with live subscriptions leaves their tasks running
/// against a registry nobody can reach.
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl Consumer {
    /// Create a consumer over a metadata source, validating the
    /// configuration.
    pub fn new(metadata: Arc<dyn MetadataClient>, config: Config) -> Result<Self> {
        if let Err(problems) = config.validate() {
            return Err(Error::Config(problems.join("; ")));
        }
        Ok(Self {
            inner: Arc::new(ConsumerInner {
                config: Arc::new(config),
                metadata,
                registry: Mutex::new(Registry::default()),
            }),
        })
    }

    /// Subscribe to one partition, starting at `offset`
    /// ([`Offset::NEWEST`], [`Offset::OLDEST`], or an absolute position
    /// within the log bounds).
    ///
    /// At most one subscription per (topic, partition) may exist at a
    /// time.
    pub async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        offset: Offset,
    ) -> Result<PartitionConsumer> {
        let (child, channels) =
            PartitionInner::new(self.inner.clone(), topic.to_string(), partition);

        child.choose_starting_offset(offset).await?;

        let (leader, epoch) = self
            .inner
            .metadata
            .leader_and_epoch(topic, partition)
            .await?;

        self.inner.add_child(&child)?;

        tokio::spawn(child.clone().dispatcher(channels.trigger_rx));
        tokio::spawn(
            child
                .clone()
                .response_feeder(channels.messages_tx, channels.feeder_rx),
        );

        child.state.lock().leader_epoch = epoch;
        let handle = ConsumerInner::ref_broker_consumer(&self.inner, leader);
        child.state.lock().broker = Some(handle.clone());
        handle.submit(child.clone());

        debug!(topic, partition, "started partition consumer");

        Ok(PartitionConsumer {
            inner: child,
            messages: channels.messages_rx,
            errors: channels.errors_rx,
        })
    }

    /// The set of known topics, as reported by the metadata source.
    pub async fn topics(&self) -> Result<Vec<String>> {
        self.inner.metadata.topics().await
    }

    /// The sorted partition ids of a topic.
    pub async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        self.inner.metadata.partitions(topic).await
    }

    /// Current high water marks per topic and partition. Marks update
    /// independently of record delivery, so consistency across
    /// partitions is not guaranteed.
    pub fn high_water_marks(&self) -> HashMap<String, HashMap<i32, i64>> {
        let mut marks: HashMap<String, HashMap<i32, i64>> = HashMap::new();
        self.inner.for_each_child(|child| {
            marks
                .entry(child.topic.clone())
                .or_default()
                .insert(child.partition, child.high_water_mark.load(Ordering::SeqCst));
        });
        marks
    }

    /// Suspend fetching for the given partitions. Paused partitions are
    /// omitted from outbound fetches but keep their state and position.
    pub fn pause(&self, topic_partitions: &HashMap<String, Vec<i32>>) {
        for (topic, partitions) in topic_partitions {
            for &partition in partitions {
                if let Some(child) = self.inner.child(topic, partition) {
                    child.pause();
                }
            }
        }
    }

    /// Resume partitions previously paused with [`pause`](Self::pause)
    /// or [`pause_all`](Self::pause_all).
    pub fn resume(&self, topic_partitions: &HashMap<String, Vec<i32>>) {
        for (topic, partitions) in topic_partitions {
            for &partition in partitions {
                if let Some(child) = self.inner.child(topic, partition) {
                    child.resume();
                }
            }
        }
    }

    /// Suspend fetching for every subscribed partition.
    pub fn pause_all(&self) {
        self.inner.for_each_child(|child| child.pause());
    }

    /// Resume every subscribed partition.
    pub fn resume_all(&self) {
        self.inner.for_each_child(|child| child.resume());
    }

    #[cfg(test)]
    pub(crate) fn inner_for_tests(&self) -> Arc<ConsumerInner> {
        self.inner.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KafkaCode;
    use async_trait::async_trait;

    struct NullMetadata;

    #[async_trait]
    impl MetadataClient for NullMetadata {
        async fn refresh_metadata(&self, _topic: &str) -> Result<()> {
            Ok(())
        }
        async fn leader_and_epoch(
            &self,
            _topic: &str,
            _partition: i32,
        ) -> Result<(Arc<dyn BrokerLink>, i32)> {
            Err(Error::Kafka(KafkaCode::LeaderNotAvailable))
        }
        async fn broker_by_id(&self, _id: BrokerId) -> Result<Arc<dyn BrokerLink>> {
            Err(Error::Kafka(KafkaCode::BrokerNotAvailable))
        }
        async fn get_offset(&self, _topic: &str, _partition: i32, _at: Offset) -> Result<i64> {
            Ok(0)
        }
        async fn topics(&self) -> Result<Vec<String>> {
            Ok(vec!["events".to_string()])
        }
        async fn partitions(&self, _topic: &str) -> Result<Vec<i32>> {
            Ok(vec![0, 1, 2])
        }
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.channel_buffer_size = 0;
        let result = Consumer::new(Arc::new(NullMetadata), config);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_metadata_passthrough() {
        let consumer = Consumer::new(Arc::new(NullMetadata), Config::default()).unwrap();
        assert_eq!(consumer.topics().await.unwrap(), vec!["events"]);
        assert_eq!(consumer.partitions("events").await.unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_duplicate_subscription_rejected() {
        let consumer = Consumer::new(Arc::new(NullMetadata), Config::default()).unwrap();
        let inner = consumer.inner_for_tests();

        let (child, _channels) = PartitionInner::new(inner.clone(), "t".to_string(), 0);
        inner.add_child(&child).unwrap();

        let (dup, _channels) = PartitionInner::new(inner.clone(), "t".to_string(), 0);
        assert!(matches!(inner.add_child(&dup), Err(Error::Config(_))));

        // another partition of the same topic is fine
        let (other, _channels) = PartitionInner::new(inner.clone(), "t".to_string(), 1);
        inner.add_child(&other).unwrap();

        // and after removal the slot is free again
        inner.remove_child("t", 0);
        let (again, _channels) = PartitionInner::new(inner, "t".to_string(), 0);
        again.consumer.add_child(&again).unwrap();
    }

    #[tokio::test]
    async fn test_high_water_marks_snapshot() {
        let consumer = Consumer::new(Arc::new(NullMetadata), Config::default()).unwrap();
        let inner = consumer.inner_for_tests();

        let (a, _ca) = PartitionInner::new(inner.clone(), "t".to_string(), 0);
        a.high_water_mark.store(11, Ordering::SeqCst);
        inner.add_child(&a).unwrap();

        let (b, _cb) = PartitionInner::new(inner.clone(), "t".to_string(), 3);
        b.high_water_mark.store(77, Ordering::SeqCst);
        inner.add_child(&b).unwrap();

        let marks = consumer.high_water_marks();
        assert_eq!(marks["t"][&0], 11);
        assert_eq!(marks["t"][&3], 77);
    }

    #[tokio::test]
    async fn test_pause_fan_out() {
        let consumer = Consumer::new(Arc::new(NullMetadata), Config::default()).unwrap();
        let inner = consumer.inner_for_tests();

        let (a, _ca) = PartitionInner::new(inner.clone(), "t".to_string(), 0);
        inner.add_child(&a).unwrap();
        let (b, _cb) = PartitionInner::new(inner.clone(), "t".to_string(), 1);
        inner.add_child(&b).unwrap();

        consumer.pause_all();
        assert!(a.is_paused());
        assert!(b.is_paused());

        let mut resume_set = HashMap::new();
        resume_set.insert("t".to_string(), vec![1]);
        consumer.resume(&resume_set);
        assert!(a.is_paused());
        assert!(!b.is_paused());

        consumer.resume_all();
        assert!(!a.is_paused());
    }
}
