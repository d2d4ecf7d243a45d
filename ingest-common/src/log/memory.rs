use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{
    LogAppender, LogError, LogMessage, LogPosition, LogRecord, Partition, PartitionReader,
    ReaderFactory, TransactionalLog,
};

/// In-process log with Kafka's visible semantics: per-partition offsets
/// starting at 0, key-based partitioning and atomic batch appends.
#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<Mutex<Inner>>,
    appended: Arc<Notify>,
}

struct Inner {
    partitions: i32,
    topics: HashMap<String, Vec<Vec<LogMessage>>>,
    unavailable: bool,
    append_delay: Option<Duration>,
    hints: HashMap<Partition, i64>,
}

impl Inner {
    fn partition_log(&mut self, topic: &str, partition: i32) -> &mut Vec<LogMessage> {
        let partitions = self.partitions;
        let logs = self
            .topics
            .entry(topic.to_owned())
            .or_insert_with(|| vec![Vec::new(); partitions as usize]);
        &mut logs[partition as usize]
    }
}

impl MemoryLog {
    pub fn new(partitions: i32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                partitions: partitions.max(1),
                topics: HashMap::new(),
                unavailable: false,
                append_delay: None,
                hints: HashMap::new(),
            })),
            appended: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Appends fail while unavailable, as when every broker is unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Delay every append, to exercise publish timeouts.
    pub fn set_append_delay(&self, delay: Option<Duration>) {
        self.lock().append_delay = delay;
    }

    /// Stable FNV-1a over the key, so one source always maps to one partition.
    pub fn partition_for(&self, key: Option<&str>) -> i32 {
        let partitions = self.lock().partitions;
        let hash = key.unwrap_or_default().bytes().fold(0xcbf29ce484222325u64, |h, b| {
            (h ^ u64::from(b)).wrapping_mul(0x100000001b3)
        });
        (hash % partitions as u64) as i32
    }

    /// Write raw bytes to an explicit partition, bypassing validation.
    pub fn append_raw(&self, topic: &str, partition: i32, key: Option<&str>, payload: &[u8]) -> i64 {
        let offset = {
            let mut inner = self.lock();
            let log = inner.partition_log(topic, partition);
            let offset = log.len() as i64;
            log.push(LogMessage {
                partition: Partition::new(topic, partition),
                offset,
                key: key.map(str::to_owned),
                payload: payload.to_vec(),
            });
            offset
        };
        self.appended.notify_waiters();
        offset
    }

    /// Every message of a topic, partition by partition.
    pub fn messages(&self, topic: &str) -> Vec<LogMessage> {
        self.lock()
            .topics
            .get(topic)
            .map(|logs| logs.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn partition_messages(&self, partition: &Partition) -> Vec<LogMessage> {
        self.lock()
            .topics
            .get(partition.topic())
            .and_then(|logs| logs.get(partition.partition_number() as usize))
            .cloned()
            .unwrap_or_default()
    }

    /// Last progress hint received for the partition.
    pub fn committed_hint(&self, partition: &Partition) -> Option<i64> {
        self.lock().hints.get(partition).copied()
    }

    pub fn reader(&self, partition: &Partition) -> MemoryPartitionReader {
        MemoryPartitionReader {
            log: self.clone(),
            partition: partition.clone(),
            cursor: 0,
        }
    }

    async fn before_append(&self) -> Result<(), LogError> {
        let delay = self.lock().append_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.lock().unavailable {
            return Err(LogError::Unavailable("all brokers down".to_owned()));
        }
        Ok(())
    }

    fn push_all(&self, topic: &str, records: Vec<LogRecord>) -> Vec<LogPosition> {
        let targets: Vec<i32> = records
            .iter()
            .map(|r| self.partition_for(r.key.as_deref()))
            .collect();

        let positions = {
            let mut inner = self.lock();
            records
                .into_iter()
                .zip(targets)
                .map(|(record, partition)| {
                    let log = inner.partition_log(topic, partition);
                    let offset = log.len() as i64;
                    log.push(LogMessage {
                        partition: Partition::new(topic, partition),
                        offset,
                        key: record.key,
                        payload: record.payload,
                    });
                    LogPosition { partition, offset }
                })
                .collect()
        };
        self.appended.notify_waiters();
        positions
    }
}

#[async_trait]
impl TransactionalLog for MemoryLog {
    async fn append_batch(
        &self,
        topic: &str,
        records: Vec<LogRecord>,
    ) -> Result<Vec<LogPosition>, LogError> {
        self.before_append().await?;
        Ok(self.push_all(topic, records))
    }
}

#[async_trait]
impl LogAppender for MemoryLog {
    async fn append(&self, topic: &str, record: LogRecord) -> Result<LogPosition, LogError> {
        self.before_append().await?;
        let mut positions = self.push_all(topic, vec![record]);
        positions
            .pop()
            .ok_or_else(|| LogError::Unavailable("append produced no position".to_owned()))
    }
}

impl ReaderFactory for MemoryLog {
    fn open(&self, partition: &Partition) -> Result<Box<dyn PartitionReader>, LogError> {
        Ok(Box::new(self.reader(partition)))
    }
}

pub struct MemoryPartitionReader {
    log: MemoryLog,
    partition: Partition,
    cursor: i64,
}

impl MemoryPartitionReader {
    fn take(&mut self, max: usize) -> Vec<LogMessage> {
        let batch: Vec<LogMessage> = self
            .log
            .partition_messages(&self.partition)
            .into_iter()
            .skip(self.cursor.max(0) as usize)
            .take(max)
            .collect();
        if let Some(last) = batch.last() {
            self.cursor = last.offset + 1;
        }
        batch
    }
}

#[async_trait]
impl PartitionReader for MemoryPartitionReader {
    fn partition(&self) -> &Partition {
        &self.partition
    }

    async fn seek(&mut self, offset: i64) -> Result<(), LogError> {
        self.cursor = offset.max(0);
        Ok(())
    }

    async fn next_batch(
        &mut self,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<LogMessage>, LogError> {
        let batch = self.take(max);
        if !batch.is_empty() {
            return Ok(batch);
        }
        let appended = self.log.appended.clone();
        _ = tokio::time::timeout(wait, appended.notified()).await;
        Ok(self.take(max))
    }

    fn commit_hint(&self, next_offset: i64) {
        let mut inner = self.log.lock();
        let hint = inner.hints.entry(self.partition.clone()).or_insert(next_offset);
        *hint = (*hint).max(next_offset);
    }
}
