//! Message types flowing through the shipper

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A raw record pulled from a Kafka topic partition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Topic the record came from
    pub topic: String,

    /// Kafka partition (the transport-level shard)
    pub kafka_partition: u32,

    /// Offset within the Kafka partition
    pub offset: u64,

    /// Record payload
    pub payload: Bytes,

    /// Broker-assigned timestamp in milliseconds, if present
    pub timestamp: Option<i64>,
}

impl Message {
    pub fn new(
        topic: impl Into<String>,
        kafka_partition: u32,
        offset: u64,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            topic: topic.into(),
            kafka_partition,
            offset,
            payload: payload.into(),
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp = Some(timestamp_ms);
        self
    }
}

/// A message annotated with the logical partitions its parser derived
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub message: Message,
    /// Ordered logical partitions, e.g. `["dt=2024-01-02"]`
    pub partitions: Vec<String>,
}

impl ParsedMessage {
    pub fn new(message: Message, partitions: Vec<String>) -> Self {
        Self {
            message,
            partitions,
        }
    }
}

/// The unit a file codec reads and writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// Kafka offset of the record
    pub offset: u64,
    /// Record bytes
    pub value: Bytes,
}

impl KeyValue {
    pub fn new(offset: u64, value: impl Into<Bytes>) -> Self {
        Self {
            offset,
            value: value.into(),
        }
    }
}
