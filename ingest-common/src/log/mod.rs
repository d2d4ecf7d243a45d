//! The durable, partitioned log as the pipeline sees it.
//!
//! Kafka is the production implementation (`kafka`), `memory` backs tests.
//! The log is only trusted for ordering within a partition and for
//! all-or-nothing batch appends. Processing progress lives in the offset
//! ledger, the log's own consumer-group bookkeeping only receives hints.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::topic_partition_list::TopicPartitionListElem;
use thiserror::Error;

pub mod kafka;
pub mod memory;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("log is unavailable: {0}")]
    Unavailable(String),
    #[error("record exceeds the maximum message size")]
    RecordTooLarge,
    #[error("transaction was aborted: {0}")]
    TransactionAborted(String),
    #[error("timed out waiting for the log")]
    Timeout,
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

/// A topic partition, the unit of ordering and of worker ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

/// A record to append. The log picks the partition from the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// Where an appended record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPosition {
    pub partition: i32,
    pub offset: i64,
}

/// A record read back from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub partition: Partition,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// Single-record append, used for the quarantine topic.
#[async_trait]
pub trait LogAppender: Send + Sync {
    async fn append(&self, topic: &str, record: LogRecord) -> Result<LogPosition, LogError>;
}

/// All-or-nothing batch append: on error no record of the batch is visible to readers.
#[async_trait]
pub trait TransactionalLog: Send + Sync {
    async fn append_batch(
        &self,
        topic: &str,
        records: Vec<LogRecord>,
    ) -> Result<Vec<LogPosition>, LogError>;
}

/// Sequential reader over a single partition, owned by that partition's worker.
#[async_trait]
pub trait PartitionReader: Send {
    fn partition(&self) -> &Partition;

    /// Position the reader so the next message returned is at `offset`, or the
    /// earliest retained one after it.
    async fn seek(&mut self, offset: i64) -> Result<(), LogError>;

    /// Up to `max` messages in log order. Waits at most `wait` for the first one
    /// and returns an empty batch if nothing arrived.
    async fn next_batch(&mut self, max: usize, wait: Duration)
        -> Result<Vec<LogMessage>, LogError>;

    /// Best-effort progress report to the log's own group bookkeeping.
    fn commit_hint(&self, _next_offset: i64) {}
}

pub trait ReaderFactory: Send + Sync {
    fn open(&self, partition: &Partition) -> Result<Box<dyn PartitionReader>, LogError>;
}

/// Receives progress hints for the consumer group, see `PartitionReader::commit_hint`.
pub trait ProgressHint: Send + Sync {
    fn record(&self, partition: &Partition, next_offset: i64);
}
