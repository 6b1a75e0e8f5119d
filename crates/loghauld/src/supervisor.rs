//! Partition supervision
//!
//! Spawns one consumer loop task per owned (topic, kafka-partition) and
//! keeps partitions isolated: a failed loop is restarted from its last
//! committed offset with capped backoff, a topic-fatal error halts only
//! that partition, and an invariant violation tears the process down.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use loghaul_core::offset::OffsetStore;
use loghaul_core::parser::{build_parser, MessageParser};
use loghaul_core::retry::RetryConfig;
use loghaul_core::{Clock, LogFilePath, Result, ShipperConfig, ShipperError};
use loghaul_storage::BlobStore;

use crate::consumer::{ConsumerLoop, LoopCounters, MemorySource, MessageSource};
use crate::uploader::Uploader;

/// One owned (topic, kafka-partition)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionAssignment {
    pub topic: String,
    pub kafka_partition: u32,
}

impl PartitionAssignment {
    pub fn new(topic: impl Into<String>, kafka_partition: u32) -> Self {
        Self {
            topic: topic.into(),
            kafka_partition,
        }
    }
}

/// Creates the transport feed for a partition. The Kafka client of the
/// embedding deployment implements this; the built-in factory feeds
/// nothing and is used to drain staged files.
pub trait SourceFactory: Send + Sync {
    fn create(&self, topic: &str, kafka_partition: u32) -> Result<Box<dyn MessageSource>>;
}

/// Factory of empty feeds, for drain runs
pub struct EmptySourceFactory;

impl SourceFactory for EmptySourceFactory {
    fn create(&self, _topic: &str, _kafka_partition: u32) -> Result<Box<dyn MessageSource>> {
        Ok(Box::new(MemorySource::empty()))
    }
}

/// Owns the shared collaborators and runs the partition tasks
pub struct Supervisor {
    config: Arc<ShipperConfig>,
    parser: Arc<dyn MessageParser>,
    uploader: Arc<Uploader>,
    offsets: Arc<dyn OffsetStore>,
    factory: Arc<dyn SourceFactory>,
    clock: Clock,
}

impl Supervisor {
    pub fn new(
        config: Arc<ShipperConfig>,
        store: Arc<dyn BlobStore>,
        offsets: Arc<dyn OffsetStore>,
        factory: Arc<dyn SourceFactory>,
        clock: Clock,
    ) -> Result<Self> {
        let parser = build_parser(&config.parser, clock.clone())?;
        let uploader = Arc::new(Uploader::new(
            store,
            offsets.clone(),
            config.group.clone(),
            config.output.file_pattern.clone(),
            &config.uploader,
        ));
        Ok(Self {
            config,
            parser,
            uploader,
            offsets,
            factory,
            clock,
        })
    }

    /// Run all partitions to completion. Listens on `shutdown` for the
    /// cooperative drain signal.
    pub async fn run(
        self,
        assignments: Vec<PartitionAssignment>,
        shutdown: broadcast::Sender<()>,
    ) -> Result<()> {
        if assignments.is_empty() {
            info!("no partitions assigned, nothing to do");
            return Ok(());
        }

        let mut tasks = tokio::task::JoinSet::new();
        for assignment in assignments {
            let supervisor = SupervisedPartition {
                config: self.config.clone(),
                parser: self.parser.clone(),
                uploader: self.uploader.clone(),
                offsets: self.offsets.clone(),
                factory: self.factory.clone(),
                clock: self.clock.clone(),
                counters: Arc::new(LoopCounters::default()),
                assignment,
            };
            let shutdown_rx = shutdown.subscribe();
            tasks.spawn(supervisor.run(shutdown_rx));
        }

        let mut first_invariant = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e @ ShipperError::Invariant(_))) => {
                    error!(error = %e, "invariant violation, tearing the process down");
                    let _ = shutdown.send(());
                    first_invariant.get_or_insert(e);
                }
                Ok(Err(e)) => {
                    // already logged by the partition task; other loops
                    // keep running
                    error!(error = %e, "partition halted");
                }
                Err(join_error) => {
                    error!(error = %join_error, "partition task aborted");
                }
            }
        }

        match first_invariant {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct SupervisedPartition {
    config: Arc<ShipperConfig>,
    parser: Arc<dyn MessageParser>,
    uploader: Arc<Uploader>,
    offsets: Arc<dyn OffsetStore>,
    factory: Arc<dyn SourceFactory>,
    clock: Clock,
    counters: Arc<LoopCounters>,
    assignment: PartitionAssignment,
}

impl SupervisedPartition {
    /// Run the loop, restarting from the last committed offset on
    /// retryable failures
    async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let restart_backoff = RetryConfig::default()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(60));
        let mut restarts = 0u32;

        loop {
            let source = self
                .factory
                .create(&self.assignment.topic, self.assignment.kafka_partition)?;
            let consumer = ConsumerLoop::new(
                &self.config,
                self.assignment.topic.clone(),
                self.assignment.kafka_partition,
                source,
                self.parser.clone(),
                self.uploader.clone(),
                self.offsets.clone(),
                self.clock.clone(),
                self.counters.clone(),
            );
            // the loop drains control signals; rebalance integration feeds
            // this channel in embedded deployments
            let (_control_tx, control_rx) = mpsc::channel(4);

            match consumer.run(shutdown.resubscribe(), control_rx).await {
                Ok(outcome) => {
                    info!(
                        topic = %self.assignment.topic,
                        kafka_partition = self.assignment.kafka_partition,
                        outcome = ?outcome,
                        messages = self.counters.messages_consumed(),
                        files = self.counters.files_uploaded(),
                        bytes = self.counters.bytes_uploaded(),
                        "partition finished"
                    );
                    return Ok(());
                }
                Err(e @ ShipperError::Invariant(_)) => return Err(e),
                Err(e @ (ShipperError::Schema(_) | ShipperError::Config(_))) => {
                    error!(
                        topic = %self.assignment.topic,
                        kafka_partition = self.assignment.kafka_partition,
                        error = %e,
                        "partition halted permanently"
                    );
                    return Err(e);
                }
                Err(e) => {
                    restarts += 1;
                    let delay = restart_backoff.delay_for_attempt(restarts);
                    warn!(
                        topic = %self.assignment.topic,
                        kafka_partition = self.assignment.kafka_partition,
                        restart = restarts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "partition loop failed, restarting from committed offset"
                    );
                    tokio::time::sleep(delay).await;
                }
            }

            // a shutdown that raced the failure ends the restart loop
            use tokio::sync::broadcast::error::TryRecvError;
            match shutdown.try_recv() {
                Ok(()) | Err(TryRecvError::Lagged(_)) | Err(TryRecvError::Closed) => {
                    return Ok(());
                }
                Err(TryRecvError::Empty) => {}
            }
        }
    }
}

/// Kafka partitions with staged files for a topic, for transport-less
/// drain runs
pub fn discover_staged_partitions(local_root: &Path, topic: &str) -> Vec<u32> {
    let mut partitions = BTreeSet::new();
    let root = local_root.to_string_lossy();
    let mut pending = vec![local_root.join(topic)];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if let Ok(parsed) = LogFilePath::parse(&root, &path.to_string_lossy()) {
                partitions.insert(parsed.kafka_partitions()[0]);
            }
        }
    }
    partitions.into_iter().collect()
}
