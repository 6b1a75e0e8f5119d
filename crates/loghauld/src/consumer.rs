//! Consumer loop
//!
//! One loop per owned (topic, kafka-partition): seek the source to the
//! committed offset, pull batches, derive logical partitions, append to the
//! registry, and flush through the uploader when the policy trips or a
//! control signal arrives.
//!
//! The transport is behind [`MessageSource`]; a Kafka client plugs in from
//! the embedding deployment. [`MemorySource`] serves tests and local runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use loghaul_core::config::{ConsumerConfig, ParserConfig, ShipperConfig};
use loghaul_core::codec::build_codec;
use loghaul_core::offset::OffsetStore;
use loghaul_core::parser::{extract_channel_identifier, fallback_partitions, MessageParser};
use loghaul_core::retry::RetryConfig;
use loghaul_core::{Clock, KeyValue, Message, Result, ShipperError};

use crate::orphan;
use crate::policy::{CommitPolicy, FlushReason};
use crate::registry::FileRegistry;
use crate::tracker::PartitionTracker;
use crate::uploader::Uploader;

/// Consecutive retryable poll failures tolerated before the partition fails
const MAX_POLL_FAILURES: u32 = 5;

/// Feed of one (topic, kafka-partition). Implementations wrap the actual
/// transport; the loop only needs seek and poll.
#[async_trait]
pub trait MessageSource: Send {
    /// Position the feed so the next poll returns this offset (or the
    /// first available one above it)
    async fn seek(&mut self, offset: u64) -> Result<()>;

    /// Pull up to `max` messages; an empty batch means nothing is
    /// available right now
    async fn poll(&mut self, max: usize) -> Result<Vec<Message>>;
}

/// Scripted in-memory source for tests and local runs
pub struct MemorySource {
    messages: Vec<Message>,
    position: usize,
}

impl MemorySource {
    /// Messages must be in ascending offset order
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            position: 0,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn seek(&mut self, offset: u64) -> Result<()> {
        self.position = self
            .messages
            .iter()
            .position(|m| m.offset >= offset)
            .unwrap_or(self.messages.len());
        Ok(())
    }

    async fn poll(&mut self, max: usize) -> Result<Vec<Message>> {
        let end = (self.position + max).min(self.messages.len());
        let batch = self.messages[self.position..end].to_vec();
        self.position = end;
        Ok(batch)
    }
}

/// Control signals a loop obeys between batches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Flush now, keep consuming
    Flush,
    /// Rebalance revocation: drain synchronously, then give up the
    /// partition
    Revoke,
}

/// How a loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Cooperative shutdown drained
    Shutdown,
    /// Revoked and drained; another consumer owns the partition now
    Revoked,
    /// Source ran dry with `exit_on_idle` set
    Drained,
}

/// Shared counters, readable by the supervisor while the loop runs
#[derive(Debug, Default)]
pub struct LoopCounters {
    pub messages_consumed: AtomicU64,
    pub parse_failures: AtomicU64,
    pub flush_cycles: AtomicU64,
    pub files_uploaded: AtomicU64,
    pub bytes_uploaded: AtomicU64,
}

impl LoopCounters {
    pub fn messages_consumed(&self) -> u64 {
        self.messages_consumed.load(Ordering::Relaxed)
    }

    pub fn parse_failures(&self) -> u64 {
        self.parse_failures.load(Ordering::Relaxed)
    }

    pub fn flush_cycles(&self) -> u64 {
        self.flush_cycles.load(Ordering::Relaxed)
    }

    pub fn files_uploaded(&self) -> u64 {
        self.files_uploaded.load(Ordering::Relaxed)
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.bytes_uploaded.load(Ordering::Relaxed)
    }
}

/// The per-partition pull/parse/route/write loop
pub struct ConsumerLoop {
    group: String,
    topic: String,
    kafka_partition: u32,
    source: Box<dyn MessageSource>,
    registry: FileRegistry,
    tracker: PartitionTracker,
    parser: Arc<dyn MessageParser>,
    parser_config: ParserConfig,
    fallback: Vec<String>,
    policy: CommitPolicy,
    uploader: Arc<Uploader>,
    offsets: Arc<dyn OffsetStore>,
    consumer_config: ConsumerConfig,
    clock: Clock,
    counters: Arc<LoopCounters>,
    poll_retry: RetryConfig,
}

impl ConsumerLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &ShipperConfig,
        topic: impl Into<String>,
        kafka_partition: u32,
        source: Box<dyn MessageSource>,
        parser: Arc<dyn MessageParser>,
        uploader: Arc<Uploader>,
        offsets: Arc<dyn OffsetStore>,
        clock: Clock,
        counters: Arc<LoopCounters>,
    ) -> Self {
        let topic = topic.into();
        let registry = FileRegistry::new(
            topic.clone(),
            kafka_partition,
            config.generation,
            config.local_path.to_string_lossy().into_owned(),
            config.output.full_extension(),
            build_codec(&config.output),
            clock.clone(),
        );
        Self {
            group: config.group.clone(),
            tracker: PartitionTracker::new(topic.clone(), kafka_partition),
            topic,
            kafka_partition,
            source,
            registry,
            parser,
            parser_config: config.parser.clone(),
            fallback: fallback_partitions(&config.parser),
            policy: CommitPolicy::new(config.policy.clone(), clock.clone()),
            uploader,
            offsets,
            consumer_config: config.consumer.clone(),
            clock,
            counters,
            poll_retry: RetryConfig::default(),
        }
    }

    pub fn counters(&self) -> Arc<LoopCounters> {
        self.counters.clone()
    }

    /// Run until shutdown, revoke, a fatal error, or (with `exit_on_idle`)
    /// a drained source.
    pub async fn run(
        mut self,
        mut shutdown: broadcast::Receiver<()>,
        mut control: mpsc::Receiver<Control>,
    ) -> Result<LoopOutcome> {
        let committed = self
            .offsets
            .committed(&self.group, &self.topic, self.kafka_partition)
            .await?;
        self.tracker.start(committed)?;
        self.source.seek(committed.unwrap_or(0)).await?;
        info!(
            topic = %self.topic,
            kafka_partition = self.kafka_partition,
            committed = ?committed,
            "consumer loop started"
        );

        self.recover_orphans(committed).await?;

        let mut poll_failures = 0u32;
        loop {
            if let Some(outcome) = self.handle_control(&mut shutdown, &mut control).await? {
                return Ok(outcome);
            }

            match self.source.poll(self.consumer_config.poll_batch_size).await {
                Ok(batch) if batch.is_empty() => {
                    poll_failures = 0;
                    self.maybe_flush().await?;
                    if self.consumer_config.exit_on_idle {
                        self.terminal_flush(FlushReason::Explicit).await?;
                        info!(
                            topic = %self.topic,
                            kafka_partition = self.kafka_partition,
                            "source drained"
                        );
                        return Ok(LoopOutcome::Drained);
                    }
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => {
                            self.terminal_flush(FlushReason::Explicit).await?;
                            return Ok(LoopOutcome::Shutdown);
                        }
                        _ = tokio::time::sleep(Duration::from_millis(
                            self.consumer_config.poll_interval_ms,
                        )) => {}
                    }
                }
                Ok(batch) => {
                    poll_failures = 0;
                    self.process_batch(batch).await?;
                    self.maybe_flush().await?;
                }
                Err(e) if e.is_retryable() && poll_failures < MAX_POLL_FAILURES => {
                    poll_failures += 1;
                    let delay = self.poll_retry.delay_for_attempt(poll_failures);
                    warn!(
                        topic = %self.topic,
                        kafka_partition = self.kafka_partition,
                        attempt = poll_failures,
                        error = %e,
                        "poll failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.tracker.fail();
                    return Err(e);
                }
            }
        }
    }

    /// Adopt files a previous run left behind and ship them right away
    async fn recover_orphans(&mut self, committed: Option<u64>) -> Result<()> {
        let adopted = orphan::scan_partition(
            self.registry.local_root(),
            &self.topic,
            self.kafka_partition,
            committed,
            &self.registry.codec(),
            &self.clock,
        )?;
        if adopted.is_empty() {
            return Ok(());
        }
        info!(
            topic = %self.topic,
            kafka_partition = self.kafka_partition,
            files = adopted.len(),
            "re-shipping recovered files"
        );
        for entry in adopted {
            self.registry.adopt(entry);
        }
        self.flush(FlushReason::Explicit).await
    }

    /// Check shutdown and control channels without blocking
    async fn handle_control(
        &mut self,
        shutdown: &mut broadcast::Receiver<()>,
        control: &mut mpsc::Receiver<Control>,
    ) -> Result<Option<LoopOutcome>> {
        use tokio::sync::broadcast::error::TryRecvError;
        match shutdown.try_recv() {
            Ok(()) | Err(TryRecvError::Lagged(_)) | Err(TryRecvError::Closed) => {
                self.terminal_flush(FlushReason::Explicit).await?;
                return Ok(Some(LoopOutcome::Shutdown));
            }
            Err(TryRecvError::Empty) => {}
        }
        match control.try_recv() {
            Ok(Control::Flush) => {
                self.flush(FlushReason::Explicit).await?;
            }
            Ok(Control::Revoke) => {
                self.terminal_flush(FlushReason::Explicit).await?;
                info!(
                    topic = %self.topic,
                    kafka_partition = self.kafka_partition,
                    "partition revoked and drained"
                );
                return Ok(Some(LoopOutcome::Revoked));
            }
            Err(_) => {}
        }
        Ok(None)
    }

    async fn process_batch(&mut self, batch: Vec<Message>) -> Result<()> {
        let count = batch.len() as u64;
        let last_offset = batch.last().map(|m| m.offset);
        for message in batch {
            self.process_message(message)?;
        }
        if let Some(last_offset) = last_offset {
            self.offsets
                .set_last_seen(&self.group, &self.topic, self.kafka_partition, last_offset)
                .await?;
        }
        self.counters
            .messages_consumed
            .fetch_add(count, Ordering::Relaxed);
        Ok(())
    }

    fn process_message(&mut self, message: Message) -> Result<()> {
        let partitions = match self.parser.extract_partitions(&message) {
            Ok(partitions) if !partitions.is_empty() => partitions,
            Ok(_) => {
                warn!(
                    topic = %self.topic,
                    offset = message.offset,
                    "parser returned no partitions, routing to fallback"
                );
                self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
                self.fallback.clone()
            }
            Err(e @ ShipperError::Parse(_)) => {
                warn!(
                    topic = %self.topic,
                    offset = message.offset,
                    error = %e,
                    "unparseable message, routing to fallback"
                );
                self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
                self.fallback.clone()
            }
            Err(e) => return Err(e),
        };

        let channel = extract_channel_identifier(&self.parser_config, &message);
        let kv = KeyValue::new(message.offset, message.payload);
        self.registry.append(&partitions, &kv, &channel)?;
        self.tracker.record_write(self.clock.now_millis());
        Ok(())
    }

    async fn maybe_flush(&mut self) -> Result<()> {
        if let Some(reason) = self.policy.should_flush(&self.registry) {
            self.flush(reason).await?;
        }
        Ok(())
    }

    /// Flush and return to consuming
    async fn flush(&mut self, reason: FlushReason) -> Result<()> {
        self.tracker.begin_flush()?;
        debug!(
            topic = %self.topic,
            kafka_partition = self.kafka_partition,
            %reason,
            "flushing"
        );
        match self.uploader.upload_partition(&mut self.registry).await {
            Ok(cycle) => {
                self.note_cycle(&cycle);
                self.tracker.flush_ok(cycle.map(|c| c.committed))?;
                Ok(())
            }
            Err(e) => {
                self.tracker.fail();
                Err(e)
            }
        }
    }

    /// Flush and release the partition (shutdown, revoke, drained source)
    async fn terminal_flush(&mut self, reason: FlushReason) -> Result<()> {
        self.tracker.begin_flush()?;
        debug!(
            topic = %self.topic,
            kafka_partition = self.kafka_partition,
            %reason,
            "draining"
        );
        match self.uploader.upload_partition(&mut self.registry).await {
            Ok(cycle) => {
                self.note_cycle(&cycle);
                self.tracker.release(cycle.map(|c| c.committed))?;
                self.offsets.flush().await?;
                Ok(())
            }
            Err(e) => {
                self.tracker.fail();
                Err(e)
            }
        }
    }

    fn note_cycle(&self, cycle: &Option<crate::uploader::UploadCycle>) {
        if let Some(cycle) = cycle {
            self.counters.flush_cycles.fetch_add(1, Ordering::Relaxed);
            self.counters
                .files_uploaded
                .fetch_add(cycle.files, Ordering::Relaxed);
            self.counters
                .bytes_uploaded
                .fetch_add(cycle.bytes, Ordering::Relaxed);
        }
    }
}
