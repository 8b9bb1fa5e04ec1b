//! Per-broker fetch multiplexing.
//!
//! All partitions led by (or read from) the same broker share one
//! multiplexer, which runs two cooperative tasks:
//!
//! - the **subscription manager** accepts newly routed partitions at any
//!   time and coalesces arrivals within a 100 ms window, so that a wave
//!   of subscriptions lands in a single fetch rather than one each;
//! - the **subscription consumer** merges each published batch into its
//!   set, issues one coalesced fetch per cycle with a block per
//!   non-paused partition, fans the response out to the feeders, waits
//!   for all of them to finish parsing, and classifies each partition's
//!   outcome: keep it, re-route it, or drop it.
//!
//! A transport failure kills the whole multiplexer: every subscription is
//! told, every one of them re-routes through its dispatcher, and late
//! arrivals receive the same error until the input drains.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::client::BrokerLink;
use crate::config::Config;
use crate::constants::{IDLE_SLEEP, SUBSCRIPTION_BATCH_WINDOW};
use crate::consumer::ConsumerInner;
use crate::consumer::partition::PartitionInner;
use crate::error::{Error, KafkaCode};
use crate::protocol::fetch::FetchRequest;
use crate::types::{BrokerId, TopicPartition};

/// Submission handle for a broker multiplexer.
///
/// Partition dispatchers hold one while routed to the broker; the
/// consumer registry holds one per live entry. The multiplexer's input
/// closes when the last handle is dropped, which by the registry's
/// ref-counting happens exactly when no subscription references the
/// broker anymore.
pub(crate) struct BrokerHandle {
    pub(crate) broker: Arc<dyn BrokerLink>,
    input: mpsc::UnboundedSender<Arc<PartitionInner>>,
}

impl BrokerHandle {
    pub(crate) fn id(&self) -> BrokerId {
        self.broker.id()
    }

    /// Queue a partition for the next subscription batch.
    pub(crate) fn submit(&self, child: Arc<PartitionInner>) {
        let _ = self.input.send(child);
    }
}

/// Start the two multiplexer tasks for a broker and return the handle.
pub(crate) fn spawn_broker_consumer(
    consumer: Arc<ConsumerInner>,
    broker: Arc<dyn BrokerLink>,
) -> Arc<BrokerHandle> {
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (batch_tx, batch_rx) = mpsc::channel(1);

    tokio::spawn(subscription_manager(broker.id(), input_rx, batch_tx));
    tokio::spawn(subscription_consumer(consumer, broker.clone(), batch_rx));

    Arc::new(BrokerHandle {
        broker,
        input: input_tx,
    })
}

/// Accept new subscriptions and publish them in coalesced batches.
///
/// An empty batch is published whenever the consumer side is ready but
/// nothing arrived, which the consumer reads as "idle, keep cycling".
async fn subscription_manager(
    broker_id: BrokerId,
    mut input: mpsc::UnboundedReceiver<Arc<PartitionInner>>,
    batches: mpsc::Sender<Vec<Arc<PartitionInner>>>,
) {
    loop {
        let mut batch: Vec<Arc<PartitionInner>> = Vec::new();

        tokio::select! {
            first = input.recv() => match first {
                Some(child) => batch.push(child),
                None => break,
            },
            published = batches.send(Vec::new()) => {
                if published.is_err() {
                    break;
                }
                continue;
            }
        }

        // collect further arrivals within the batching window
        let window = tokio::time::sleep(SUBSCRIPTION_BATCH_WINDOW);
        tokio::pin!(window);
        loop {
            tokio::select! {
                _ = &mut window => break,
                more = input.recv() => match more {
                    Some(child) => batch.push(child),
                    None => break,
                },
            }
        }

        debug!(
            broker = broker_id.value(),
            count = batch.len(),
            "accumulated new subscriptions"
        );
        if batches.send(batch).await.is_err() {
            break;
        }
    }
}

/// The fetch cycle: merge subscriptions, fetch, fan out, classify.
async fn subscription_consumer(
    consumer: Arc<ConsumerInner>,
    broker: Arc<dyn BrokerLink>,
    mut batches: mpsc::Receiver<Vec<Arc<PartitionInner>>>,
) {
    let mut subscriptions: HashMap<TopicPartition, Arc<PartitionInner>> = HashMap::new();

    while let Some(batch) = batches.recv().await {
        update_subscriptions(&broker, &mut subscriptions, batch);

        if subscriptions.is_empty() {
            // about to shut down, or about to receive more subscriptions
            tokio::time::sleep(IDLE_SLEEP).await;
            continue;
        }

        let request = build_fetch_request(&consumer.config, &subscriptions);
        if request.num_blocks() == 0 {
            // every subscription is paused
            tokio::time::sleep(IDLE_SLEEP).await;
            continue;
        }

        let response = match broker.fetch(request).await {
            Ok(response) => Arc::new(response),
            Err(err) => {
                warn!(
                    broker = broker.id().value(),
                    error = %err,
                    "disconnecting due to error processing fetch request"
                );
                abort(&consumer, &broker, &mut subscriptions, &mut batches, err).await;
                return;
            }
        };

        // every addressed feeder must finish parsing before the next
        // cycle may move the cursors
        let mut acks = Vec::new();
        for child in subscriptions.values() {
            if response.block(&child.topic, child.partition).is_none() {
                continue;
            }
            if let Some(ack) = child.feed(response.clone()).await {
                acks.push(ack);
            }
        }
        for ack in acks {
            let _ = ack.await;
        }

        handle_responses(&broker, &mut subscriptions).await;
    }
}

/// Merge a published batch and drop subscriptions that died since the
/// last cycle, closing their triggers so their dispatchers can finish.
fn update_subscriptions(
    broker: &Arc<dyn BrokerLink>,
    subscriptions: &mut HashMap<TopicPartition, Arc<PartitionInner>>,
    batch: Vec<Arc<PartitionInner>>,
) {
    for child in batch {
        debug!(
            broker = broker.id().value(),
            topic = %child.topic,
            partition = child.partition,
            "added subscription"
        );
        subscriptions.insert(TopicPartition::new(child.topic.clone(), child.partition), child);
    }

    subscriptions.retain(|tp, child| {
        if child.is_dying() {
            debug!(
                broker = broker.id().value(),
                topic_partition = %tp,
                "closed dead subscription"
            );
            child.close_trigger();
            false
        } else {
            true
        }
    });
}

/// One block per non-paused subscription, at its current cursor.
fn build_fetch_request(
    config: &Config,
    subscriptions: &HashMap<TopicPartition, Arc<PartitionInner>>,
) -> FetchRequest {
    let mut request = FetchRequest::from_config(config);
    for child in subscriptions.values() {
        if child.is_paused() {
            continue;
        }
        let st = child.state.lock();
        request.add_block(
            &child.topic,
            child.partition,
            st.offset,
            st.fetch_size,
            st.leader_epoch,
        );
    }
    request
}

/// Classify the outcome each feeder left behind.
async fn handle_responses(
    broker: &Arc<dyn BrokerLink>,
    subscriptions: &mut HashMap<TopicPartition, Arc<PartitionInner>>,
) {
    let mut to_remove = Vec::new();

    for (tp, child) in subscriptions.iter() {
        let outcome = child.state.lock().response_outcome.take();

        let Some(err) = outcome else {
            // healthy, but maybe better served elsewhere: follow a
            // preferred-replica hint or a leadership change
            if let Ok((target, _epoch)) = child.preferred_broker().await {
                if target.id() != broker.id() {
                    debug!(
                        broker = broker.id().value(),
                        preferred = target.id().value(),
                        topic_partition = %tp,
                        "abandoned in favor of preferred broker"
                    );
                    child.trigger();
                    to_remove.push(tp.clone());
                }
            }
            continue;
        };

        // any failure invalidates the replica preference
        child.reset_preferred_replica();

        match err {
            Error::TimedOut => {
                // the feeder already queued itself back on our input
                warn!(
                    broker = broker.id().value(),
                    topic_partition = %tp,
                    "abandoned subscription because consuming was taking too long"
                );
                to_remove.push(tp.clone());
            }
            Error::Kafka(KafkaCode::OffsetOutOfRange) => {
                // retrying would fail identically; shut the subscription
                // down and let the user decide
                child.send_error(err).await;
                warn!(
                    topic_partition = %tp,
                    "shutting down subscription: requested offset is out of range"
                );
                child.close_trigger();
                to_remove.push(tp.clone());
            }
            Error::Kafka(code) if code.is_silently_retriable() => {
                debug!(
                    broker = broker.id().value(),
                    topic_partition = %tp,
                    code = ?code,
                    "abandoned subscription for re-dispatch"
                );
                child.trigger();
                to_remove.push(tp.clone());
            }
            other => {
                // unknown failure: tell the user and re-dispatch
                child.send_error(other).await;
                warn!(
                    broker = broker.id().value(),
                    topic_partition = %tp,
                    "abandoned subscription after error"
                );
                child.trigger();
                to_remove.push(tp.clone());
            }
        }
    }

    for tp in to_remove {
        subscriptions.remove(&tp);
    }
}

/// Transport failure: detach from the registry, close the connection,
/// broadcast the error, and drain late arrivals with the same error.
async fn abort(
    consumer: &Arc<ConsumerInner>,
    broker: &Arc<dyn BrokerLink>,
    subscriptions: &mut HashMap<TopicPartition, Arc<PartitionInner>>,
    batches: &mut mpsc::Receiver<Vec<Arc<PartitionInner>>>,
    err: Error,
) {
    consumer.abandon_broker_consumer(broker);
    let _ = broker.close().await;

    for (_, child) in subscriptions.drain() {
        child.send_error(err.clone()).await;
        child.trigger();
    }

    while let Some(batch) = batches.recv().await {
        if batch.is_empty() {
            tokio::time::sleep(IDLE_SLEEP).await;
            continue;
        }
        for child in batch {
            child.send_error(err.clone()).await;
            child.trigger();
        }
    }
}
