//! Per-partition consumption.
//!
//! Each subscribed partition runs two cooperative tasks around a shared
//! [`PartitionInner`]:
//!
//! - the **dispatcher** reacts to re-dispatch triggers: it backs off,
//!   refreshes metadata, resolves the partition's effective broker
//!   (preferred read replica first, leader as fallback), and hands the
//!   subscription to that broker's multiplexer;
//! - the **response feeder** parses each fetch response addressed to the
//!   partition and pushes the surviving records to the user, policing the
//!   per-record processing-time budget.
//!
//! The user faces a [`PartitionConsumer`] handle wrapping the delivery
//! channels. Shutdown is signalled once (`async_close`) and observed by
//! every task; the dispatcher tears the registry entry down and the
//! feeder closes the user-facing channels.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::client::BrokerLink;
use crate::constants::NO_PREFERRED_REPLICA;
use crate::consumer::broker::BrokerHandle;
use crate::consumer::{ConsumerInner, ConsumerRecord};
use crate::error::{ConsumerError, ConsumerErrors, Error, KafkaCode, Result};
use crate::protocol::fetch::{FetchResponse, Records};
use crate::protocol::legacy::MessageSet;
use crate::protocol::record::{ControlRecordType, RecordBatch};
use crate::types::{BrokerId, Offset};

/// A fetch response addressed to one partition, paired with the ack the
/// broker multiplexer is waiting on before its next cycle.
pub(crate) struct FeederMsg {
    pub(crate) response: Arc<FetchResponse>,
    pub(crate) ack: oneshot::Sender<()>,
}

/// Cursor state handed between the tasks at the ack barrier.
pub(crate) struct SubscriptionState {
    /// Next offset to request; advances monotonically on delivery.
    pub(crate) offset: i64,
    /// Current per-partition byte hint.
    pub(crate) fetch_size: i32,
    pub(crate) leader_epoch: i32,
    pub(crate) preferred_read_replica: i32,
    /// Outcome left by the feeder for the multiplexer's classification.
    pub(crate) response_outcome: Option<Error>,
    /// The broker multiplexer currently holding this subscription.
    pub(crate) broker: Option<Arc<BrokerHandle>>,
}

/// Shared core of one partition subscription.
pub(crate) struct PartitionInner {
    pub(crate) consumer: Arc<ConsumerInner>,
    pub(crate) topic: String,
    pub(crate) partition: i32,

    pub(crate) high_water_mark: AtomicI64,
    paused: AtomicBool,
    retries: AtomicI32,

    pub(crate) state: Mutex<SubscriptionState>,

    errors_tx: Mutex<Option<mpsc::Sender<ConsumerError>>>,
    feeder_tx: Mutex<Option<mpsc::Sender<FeederMsg>>>,
    trigger_tx: Mutex<Option<mpsc::Sender<()>>>,
    dying: watch::Sender<bool>,
    closed: AtomicBool,
}

/// Channel ends handed to the spawned tasks and the user handle.
pub(crate) struct PartitionChannels {
    pub(crate) messages_tx: mpsc::Sender<ConsumerRecord>,
    pub(crate) messages_rx: mpsc::Receiver<ConsumerRecord>,
    pub(crate) errors_rx: mpsc::Receiver<ConsumerError>,
    pub(crate) feeder_rx: mpsc::Receiver<FeederMsg>,
    pub(crate) trigger_rx: mpsc::Receiver<()>,
}

impl PartitionInner {
    pub(crate) fn new(
        consumer: Arc<ConsumerInner>,
        topic: String,
        partition: i32,
    ) -> (Arc<Self>, PartitionChannels) {
        let buffer = consumer.config.channel_buffer_size;
        let (messages_tx, messages_rx) = mpsc::channel(buffer);
        let (errors_tx, errors_rx) = mpsc::channel(buffer);
        let (feeder_tx, feeder_rx) = mpsc::channel(1);
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (dying, _) = watch::channel(false);

        let fetch_default = consumer.config.fetch.default;
        let inner = Arc::new(Self {
            consumer,
            topic,
            partition,
            high_water_mark: AtomicI64::new(0),
            paused: AtomicBool::new(false),
            retries: AtomicI32::new(0),
            state: Mutex::new(SubscriptionState {
                offset: 0,
                fetch_size: fetch_default,
                leader_epoch: crate::constants::NO_LEADER_EPOCH,
                preferred_read_replica: NO_PREFERRED_REPLICA,
                response_outcome: None,
                broker: None,
            }),
            errors_tx: Mutex::new(Some(errors_tx)),
            feeder_tx: Mutex::new(Some(feeder_tx)),
            trigger_tx: Mutex::new(Some(trigger_tx)),
            dying,
            closed: AtomicBool::new(false),
        });

        (
            inner,
            PartitionChannels {
                messages_tx,
                messages_rx,
                errors_rx,
                feeder_rx,
                trigger_rx,
            },
        )
    }

    // ------------------------------------------------------------------
    // Lifecycle signals
    // ------------------------------------------------------------------

    pub(crate) fn is_dying(&self) -> bool {
        *self.dying.borrow()
    }

    pub(crate) fn signal_dying(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.dying.send(true);
        }
    }

    fn subscribe_dying(&self) -> watch::Receiver<bool> {
        self.dying.subscribe()
    }

    /// Wait until `dying` becomes true (or the sender is dropped).
    ///
    /// Equivalent to `dying.wait_for(|d| *d).await`, but avoids holding a
    /// `watch::Ref` (backed by a `RwLockReadGuard`) across the `.await`
    /// inside `tokio::select!`, which would make the enclosing future
    /// non-`Send`.
    async fn wait_until_dying(dying: &mut watch::Receiver<bool>) {
        loop {
            if *dying.borrow() {
                return;
            }
            if dying.changed().await.is_err() {
                return;
            }
        }
    }

    /// Queue a re-dispatch. Concurrent triggers coalesce: at most one is
    /// pending at a time, so repeated failures cannot pile up dispatcher
    /// passes.
    pub(crate) fn trigger(&self) {
        if let Some(tx) = &*self.trigger_tx.lock() {
            let _ = tx.try_send(());
        }
    }

    /// Drop the trigger sender; the dispatcher drains and exits.
    pub(crate) fn close_trigger(&self) {
        self.trigger_tx.lock().take();
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub(crate) fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Hand a response to the feeder. Returns the ack the caller must
    /// await, or `None` when the partition is already tearing down.
    pub(crate) async fn feed(&self, response: Arc<FetchResponse>) -> Option<oneshot::Receiver<()>> {
        let tx = self.feeder_tx.lock().clone()?;
        let (ack, ack_rx) = oneshot::channel();
        tx.send(FeederMsg { response, ack }).await.ok()?;
        Some(ack_rx)
    }

    pub(crate) fn reset_preferred_replica(&self) {
        self.state.lock().preferred_read_replica = NO_PREFERRED_REPLICA;
    }

    pub(crate) async fn send_error(&self, err: Error) {
        let consumer_error = ConsumerError {
            topic: self.topic.clone(),
            partition: self.partition,
            err,
        };
        if self.consumer.config.return_errors {
            let tx = self.errors_tx.lock().clone();
            if let Some(tx) = tx {
                let _ = tx.send(consumer_error).await;
            }
        } else {
            warn!(error = %consumer_error, "consumer error");
        }
    }

    fn compute_backoff(&self) -> Duration {
        if let Some(backoff_fn) = &self.consumer.config.retry.backoff_fn {
            let retries = self.retries.fetch_add(1, Ordering::SeqCst) + 1;
            backoff_fn(retries)
        } else {
            self.consumer.config.retry.backoff
        }
    }

    fn apply_interceptors(&self, record: &mut ConsumerRecord) {
        for interceptor in &self.consumer.config.interceptors {
            let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                interceptor.on_consume(record)
            }));
            if caught.is_err() {
                warn!(
                    topic = %self.topic,
                    partition = self.partition,
                    "interceptor panicked; record passed through unmodified"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Broker resolution
    // ------------------------------------------------------------------

    /// Resolve a starting position against the log bounds.
    pub(crate) async fn choose_starting_offset(&self, offset: Offset) -> Result<()> {
        let metadata = &self.consumer.metadata;
        let newest = metadata
            .get_offset(&self.topic, self.partition, Offset::NEWEST)
            .await?;
        self.high_water_mark.store(newest, Ordering::SeqCst);
        let oldest = metadata
            .get_offset(&self.topic, self.partition, Offset::OLDEST)
            .await?;

        let resolved = match offset {
            o if o == Offset::NEWEST => newest,
            o if o == Offset::OLDEST => oldest,
            Offset(abs) if abs >= oldest && abs <= newest => abs,
            _ => return Err(Error::Kafka(KafkaCode::OffsetOutOfRange)),
        };
        self.state.lock().offset = resolved;
        Ok(())
    }

    /// The broker this partition should consume from: the preferred read
    /// replica when one is set and reachable, the leader otherwise. An
    /// unreachable preferred replica resets the preference and asks for
    /// fresh metadata.
    pub(crate) async fn preferred_broker(&self) -> Result<(Arc<dyn BrokerLink>, i32)> {
        let preferred = self.state.lock().preferred_read_replica;
        if preferred >= 0 {
            match self
                .consumer
                .metadata
                .broker_by_id(BrokerId(preferred))
                .await
            {
                Ok(broker) => {
                    let epoch = self.state.lock().leader_epoch;
                    return Ok((broker, epoch));
                }
                Err(_) => {
                    warn!(
                        topic = %self.topic,
                        partition = self.partition,
                        replica = preferred,
                        "preferred read replica is not reachable, falling back to the leader"
                    );
                    self.reset_preferred_replica();
                    let _ = self.consumer.metadata.refresh_metadata(&self.topic).await;
                }
            }
        }

        self.consumer
            .metadata
            .leader_and_epoch(&self.topic, self.partition)
            .await
    }

    pub(crate) fn release_broker(&self) {
        let handle = self.state.lock().broker.take();
        if let Some(handle) = handle {
            self.consumer.unref_broker_consumer(&handle);
        }
    }

    async fn dispatch(this: &Arc<Self>) -> Result<()> {
        this.consumer.metadata.refresh_metadata(&this.topic).await?;

        let (broker, epoch) = this.preferred_broker().await?;
        this.state.lock().leader_epoch = epoch;

        let handle = ConsumerInner::ref_broker_consumer(&this.consumer, broker);
        this.state.lock().broker = Some(handle.clone());
        handle.submit(this.clone());

        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatcher task
    // ------------------------------------------------------------------

    pub(crate) async fn dispatcher(self: Arc<Self>, mut trigger_rx: mpsc::Receiver<()>) {
        let mut dying = self.subscribe_dying();

        while trigger_rx.recv().await.is_some() {
            tokio::select! {
                _ = Self::wait_until_dying(&mut dying) => {
                    self.close_trigger();
                }
                _ = tokio::time::sleep(self.compute_backoff()) => {
                    self.release_broker();
                    if let Err(err) = Self::dispatch(&self).await {
                        self.send_error(err).await;
                        self.trigger();
                    }
                }
            }
        }

        self.release_broker();
        self.consumer.remove_child(&self.topic, self.partition);
        self.feeder_tx.lock().take();
    }

    // ------------------------------------------------------------------
    // Response feeder task
    // ------------------------------------------------------------------

    pub(crate) async fn response_feeder(
        self: Arc<Self>,
        messages_tx: mpsc::Sender<ConsumerRecord>,
        mut feeder_rx: mpsc::Receiver<FeederMsg>,
    ) {
        let mut dying = self.subscribe_dying();
        let budget = self.consumer.config.max_processing_time;

        'feeder: while let Some(FeederMsg { response, ack }) = feeder_rx.recv().await {
            let parsed = self.parse_response(response.as_ref());
            let success = parsed.outcome.is_none();
            self.state.lock().response_outcome = parsed.outcome;
            if success {
                self.retries.store(0, Ordering::SeqCst);
            }
            if parsed.oversized {
                self.send_error(Error::MessageTooLarge).await;
            }

            let mut pending: VecDeque<ConsumerRecord> = parsed.records.into();
            while let Some(mut record) = pending.pop_front() {
                self.apply_interceptors(&mut record);

                let mut first_attempt = true;
                loop {
                    tokio::select! {
                        _ = Self::wait_until_dying(&mut dying) => {
                            drop(ack);
                            continue 'feeder;
                        }
                        delivered = messages_tx.send_timeout(record, budget) => match delivered {
                            Ok(()) => break,
                            Err(SendTimeoutError::Timeout(returned)) => {
                                if first_attempt {
                                    // the first expiry is free; try once more
                                    first_attempt = false;
                                    record = returned;
                                    continue;
                                }
                                self.state.lock().response_outcome = Some(Error::TimedOut);
                                drop(ack);

                                // opportunistically drain the rest, no budget
                                pending.push_front(returned);
                                while let Some(mut rest) = pending.pop_front() {
                                    self.apply_interceptors(&mut rest);
                                    tokio::select! {
                                        _ = Self::wait_until_dying(&mut dying) => break,
                                        sent = messages_tx.send(rest) => {
                                            if sent.is_err() {
                                                break;
                                            }
                                        }
                                    }
                                }

                                // rejoin the multiplexer's input queue
                                let handle = self.state.lock().broker.clone();
                                if let Some(handle) = handle {
                                    handle.submit(self.clone());
                                }
                                continue 'feeder;
                            }
                            Err(SendTimeoutError::Closed(_)) => {
                                // the user dropped the receiver
                                drop(ack);
                                continue 'feeder;
                            }
                        }
                    }
                }
            }

            drop(ack);
        }

        // feeder closed by the dispatcher's teardown: close the delivery
        // channels, messages first
        drop(messages_tx);
        self.errors_tx.lock().take();
    }

    // ------------------------------------------------------------------
    // Fetch-response parsing
    // ------------------------------------------------------------------

    /// Transform one fetch response into deliverable records plus
    /// subscription mutations. Deterministic for a given response and
    /// subscription state.
    pub(crate) fn parse_response(&self, response: &FetchResponse) -> ParsedFetch {
        // A throttled response with no blocks is the broker pushing back.
        if response.throttle_time_ms != 0 && response.blocks.is_empty() {
            debug!(
                throttle_ms = response.throttle_time_ms,
                "fetch response throttled"
            );
            return ParsedFetch::empty();
        }

        let Some(block) = response.block(&self.topic, self.partition) else {
            return ParsedFetch::failed(Error::IncompleteResponse);
        };

        if block.err != KafkaCode::None {
            return ParsedFetch::failed(Error::Kafka(block.err));
        }

        let config = &self.consumer.config;
        let mut st = self.state.lock();

        if block.preferred_read_replica != NO_PREFERRED_REPLICA {
            st.preferred_read_replica = block.preferred_read_replica;
        }

        if block.num_records() == 0 {
            if block.partial_trailing {
                // A lone message did not fit in our fetch size: grow and
                // retry, or skip it once growth is exhausted.
                if config.fetch.max > 0 && st.fetch_size == config.fetch.max {
                    st.offset += 1;
                    return ParsedFetch::oversized();
                }
                st.fetch_size = st.fetch_size.saturating_mul(2);
                if config.fetch.max > 0 && st.fetch_size > config.fetch.max {
                    st.fetch_size = config.fetch.max;
                }
            } else if let Some(next) = block.records_next_offset {
                if next <= block.high_watermark {
                    // all records below `next` were compacted away; step
                    // over the gap instead of refetching it forever
                    debug!(
                        topic = %self.topic,
                        partition = self.partition,
                        next_offset = next,
                        "zero records below the high watermark, advancing"
                    );
                    st.offset = next;
                }
            }
            return ParsedFetch::empty();
        }

        // records flowed again: reset the fetch size
        st.fetch_size = config.fetch.default;
        self.high_water_mark
            .store(block.high_watermark, Ordering::SeqCst);

        let read_committed =
            config.isolation_level == crate::config::IsolationLevel::ReadCommitted;
        let mut pending_aborts: VecDeque<_> = block.aborted_transactions_sorted().into();
        let mut aborted_producers = std::collections::HashSet::new();

        let mut records = Vec::new();
        for container in &block.records {
            match container {
                Records::Legacy(set) => {
                    self.parse_legacy_blocks(&mut st, set, &mut records);
                }
                Records::Default(batch) => {
                    // producers whose aborted range has begun by this batch
                    while let Some(txn) = pending_aborts.front() {
                        if txn.first_offset > batch.last_offset() {
                            break;
                        }
                        aborted_producers.insert(txn.producer_id);
                        pending_aborts.pop_front();
                    }

                    // advance the cursor past the batch before deciding
                    // whether its records are visible
                    let batch_records = self.parse_batch_records(&mut st, batch);

                    if batch.control {
                        match batch.control_record() {
                            Ok(marker) => {
                                if marker.record_type == ControlRecordType::Abort {
                                    aborted_producers.remove(&batch.producer_id);
                                }
                            }
                            Err(err) => {
                                if read_committed {
                                    return ParsedFetch::failed(err);
                                }
                            }
                        }
                        continue;
                    }

                    if read_committed
                        && batch.transactional
                        && aborted_producers.contains(&batch.producer_id)
                    {
                        continue;
                    }

                    records.extend(batch_records);
                }
            }
        }

        ParsedFetch {
            records,
            outcome: None,
            oversized: false,
        }
    }

    /// Emit a legacy message set, recomputing absolute offsets for
    /// compressed magic-1 wrappers whose broker stored the wrapper at the
    /// offset of its *last* inner message.
    fn parse_legacy_blocks(
        &self,
        st: &mut SubscriptionState,
        set: &MessageSet,
        out: &mut Vec<ConsumerRecord>,
    ) {
        let before = out.len();
        for block in &set.blocks {
            let inner = block.messages();
            let last_inner_offset = inner.last().map(|m| m.offset).unwrap_or(block.offset);
            for msg in inner {
                let mut offset = msg.offset;
                let mut timestamp = msg.message.timestamp;
                if msg.message.version >= 1 {
                    offset += block.offset - last_inner_offset;
                    if msg.message.log_append_time {
                        timestamp = block.message.timestamp;
                    }
                }
                if offset < st.offset {
                    continue;
                }
                out.push(ConsumerRecord {
                    topic: self.topic.clone(),
                    partition: self.partition,
                    offset,
                    timestamp,
                    block_timestamp: block.message.timestamp,
                    key: msg.message.key.clone(),
                    value: msg.message.value.clone(),
                    headers: Vec::new(),
                });
                st.offset = offset + 1;
            }
        }
        if out.len() == before {
            // everything filtered: step forward to guarantee progress
            st.offset += 1;
        }
    }

    /// Emit a record batch, advancing the cursor past every record it
    /// covers. The caller decides whether the returned records are
    /// user-visible.
    fn parse_batch_records(
        &self,
        st: &mut SubscriptionState,
        batch: &RecordBatch,
    ) -> Vec<ConsumerRecord> {
        let mut out = Vec::with_capacity(batch.records.len());
        for record in &batch.records {
            let offset = batch.first_offset + record.offset_delta;
            if offset < st.offset {
                continue;
            }
            let timestamp = if batch.log_append_time {
                batch.max_timestamp
            } else {
                batch.first_timestamp + record.timestamp_delta
            };
            out.push(ConsumerRecord {
                topic: self.topic.clone(),
                partition: self.partition,
                offset,
                timestamp,
                block_timestamp: -1,
                key: record.key.clone(),
                value: record.value.clone(),
                headers: record.headers.clone(),
            });
            st.offset = offset + 1;
        }
        if out.is_empty() {
            st.offset += 1;
        }
        out
    }
}

/// Result of parsing one fetch response for one partition.
pub(crate) struct ParsedFetch {
    pub(crate) records: Vec<ConsumerRecord>,
    pub(crate) outcome: Option<Error>,
    /// A `MessageTooLarge` must be surfaced to the user.
    pub(crate) oversized: bool,
}

impl ParsedFetch {
    fn empty() -> Self {
        Self {
            records: Vec::new(),
            outcome: None,
            oversized: false,
        }
    }

    fn failed(err: Error) -> Self {
        Self {
            records: Vec::new(),
            outcome: Some(err),
            oversized: false,
        }
    }

    fn oversized() -> Self {
        Self {
            records: Vec::new(),
            outcome: None,
            oversized: true,
        }
    }
}

/// A live subscription to one partition.
///
/// Call [`recv`](Self::recv) to consume records. Always finish with
/// [`close`](Self::close) (or at least [`async_close`](Self::async_close))
/// so the subscription's tasks and broker references are released; a
/// handle that is merely dropped leaks its registry entry until the
/// `Consumer` goes away.
///
/// The subscription stops itself in exactly one case: the broker reports
/// the requested offset as out of range. Every other failure is retried
/// forever, surfacing on [`recv_error`](Self::recv_error) when
/// `return_errors` is set.
pub struct PartitionConsumer {
    pub(crate) inner: Arc<PartitionInner>,
    pub(crate) messages: mpsc::Receiver<ConsumerRecord>,
    pub(crate) errors: mpsc::Receiver<ConsumerError>,
}

impl PartitionConsumer {
    /// Receive the next record. `None` once the subscription has fully
    /// shut down and the delivery queue is drained.
    pub async fn recv(&mut self) -> Option<ConsumerRecord> {
        self.messages.recv().await
    }

    /// Receive a record if one is already queued.
    pub fn try_recv(&mut self) -> Option<ConsumerRecord> {
        self.messages.try_recv().ok()
    }

    /// Receive the next error. Errors only arrive here when
    /// `return_errors` is set; otherwise they are logged.
    pub async fn recv_error(&mut self) -> Option<ConsumerError> {
        self.errors.recv().await
    }

    /// Receive an error if one is already queued.
    pub fn try_recv_error(&mut self) -> Option<ConsumerError> {
        self.errors.try_recv().ok()
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn partition(&self) -> i32 {
        self.inner.partition
    }

    /// The broker-reported end of the partition's log, as of the last
    /// fetch. Updates independently of record delivery.
    pub fn high_water_mark(&self) -> i64 {
        self.inner.high_water_mark.load(Ordering::SeqCst)
    }

    /// Omit this partition from outbound fetches. Its cursor and state
    /// are retained.
    pub fn pause(&self) {
        self.inner.pause();
    }

    /// Re-include this partition in outbound fetches.
    pub fn resume(&self) {
        self.inner.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.is_paused()
    }

    /// Begin shutdown and return immediately. Idempotent. Keep servicing
    /// [`recv`](Self::recv) until it returns `None`.
    pub fn async_close(&self) {
        self.inner.signal_dying();
    }

    /// Shut down, wait for teardown, and return any errors accumulated
    /// on the error channel.
    pub async fn close(mut self) -> std::result::Result<(), ConsumerErrors> {
        self.async_close();

        let mut harvested = Vec::new();
        while let Some(err) = self.errors.recv().await {
            harvested.push(err);
        }

        if harvested.is_empty() {
            Ok(())
        } else {
            Err(ConsumerErrors(harvested))
        }
    }
}
