#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use ingest_common::cache::MockRedisClient;
use ingest_common::dead_letter::DeadLetterRouter;
use ingest_common::event::CandidateRecord;
use ingest_common::ledger::{ConsumerOffset, LedgerError, MemoryOffsetLedger, OffsetLedger};
use ingest_common::log::memory::MemoryLog;
use ingest_common::log::Partition;
use ingest_common::retry::RetryPolicy;
use ingest_common::store::MemoryStore;
use ingest_common::time::FixedTime;
use ingest_processor::error::WorkerError;
use ingest_processor::idempotency::IdempotencyCache;
use ingest_processor::processor::{IdempotentProcessor, ProcessorSettings};
use ingest_processor::worker::{PartitionWorker, WorkerSettings};
use ingest_publisher::fingerprint::FingerprintStore;
use ingest_publisher::publisher::EventPublisher;

pub const GROUP: &str = "ingest-processor";
pub const TOPIC: &str = "product-events";
pub const DEAD_LETTER_TOPIC: &str = "dead-letter-queue";
pub const NOW_MILLIS: i64 = 1_700_000_000_000;

pub fn candidate(external_id: &str, title: &str, price: &str) -> CandidateRecord {
    serde_json::from_value(serde_json::json!({
        "external_id": external_id,
        "title": title,
        "sale_price": price,
        "product_url": format!("https://shop.example/p/{external_id}"),
    }))
    .unwrap()
}

pub fn worker_settings() -> WorkerSettings {
    WorkerSettings {
        batch_size: 2,
        poll_timeout: Duration::from_millis(20),
        subscription_start: 0,
    }
}

/// Publisher, log, cache, store and ledger wired the way the binaries wire
/// them, with every external system replaced by its in-memory fake.
pub struct Pipeline {
    pub log: MemoryLog,
    pub cache: MockRedisClient,
    pub store: Arc<MemoryStore>,
    pub ledger: Arc<MemoryOffsetLedger>,
    pub processor: Arc<IdempotentProcessor>,
}

impl Pipeline {
    pub fn new(partitions: i32) -> Self {
        let ledger = Arc::new(MemoryOffsetLedger::new());
        Self::build(partitions, Arc::new(MemoryStore::new()), ledger)
    }

    /// The store records offsets in the same unit of work as the upsert, like `PgStore`.
    pub fn transactional(partitions: i32) -> Self {
        let ledger = Arc::new(MemoryOffsetLedger::new());
        let store = Arc::new(MemoryStore::with_ledger(ledger.clone()));
        Self::build(partitions, store, ledger)
    }

    fn build(partitions: i32, store: Arc<MemoryStore>, ledger: Arc<MemoryOffsetLedger>) -> Self {
        let log = MemoryLog::new(partitions);
        let cache = MockRedisClient::new();
        let clock = Arc::new(FixedTime::from_millis(NOW_MILLIS));
        let processor = Arc::new(IdempotentProcessor::new(
            store.clone(),
            IdempotencyCache::new(Arc::new(cache.clone()), 86400),
            DeadLetterRouter::new(
                Arc::new(log.clone()),
                DEAD_LETTER_TOPIC.to_string(),
                Duration::from_millis(100),
                clock.clone(),
            ),
            GROUP.to_string(),
            ProcessorSettings {
                retry_policy: RetryPolicy::immediate(),
                ..Default::default()
            },
            clock,
        ));

        Self {
            log,
            cache,
            store,
            ledger,
            processor,
        }
    }

    pub fn publisher(&self, fingerprints: MockRedisClient) -> EventPublisher {
        EventPublisher::new(
            Arc::new(self.log.clone()),
            FingerprintStore::new(Arc::new(fingerprints), 604800),
            TOPIC.to_string(),
            100,
            Duration::from_secs(1),
            Arc::new(FixedTime::from_millis(NOW_MILLIS)),
        )
    }

    pub fn partition_of(&self, source: &str) -> Partition {
        Partition::new(TOPIC, self.log.partition_for(Some(source)))
    }

    pub fn last_offset(&self, partition: &Partition) -> Option<i64> {
        self.log
            .partition_messages(partition)
            .last()
            .map(|message| message.offset)
    }

    /// Run a worker until it committed the partition's last offset, or stopped on its own.
    pub async fn run_worker(
        &self,
        partition: &Partition,
        ledger: Arc<dyn OffsetLedger>,
    ) -> Result<Option<i64>, WorkerError> {
        let cancel = CancellationToken::new();
        let worker = PartitionWorker::new(
            Box::new(self.log.reader(partition)),
            self.processor.clone(),
            ledger,
            worker_settings(),
            cancel.clone(),
        );
        let handle = tokio::spawn(worker.run());
        let target = self.last_offset(partition);

        for _ in 0..500 {
            if handle.is_finished() || self.ledger.get(GROUP, partition) == target {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.expect("partition worker panicked")
    }
}

/// Ledger whose `fail_at`-th commit (0-based) fails once, as if the process
/// died between the store write and the ledger write.
pub struct CrashingLedger {
    inner: Arc<MemoryOffsetLedger>,
    fail_at: usize,
    commits: AtomicUsize,
}

impl CrashingLedger {
    pub fn new(inner: Arc<MemoryOffsetLedger>, fail_at: usize) -> Self {
        Self {
            inner,
            fail_at,
            commits: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl OffsetLedger for CrashingLedger {
    async fn last_committed(
        &self,
        consumer_group: &str,
        partition: &Partition,
    ) -> Result<Option<i64>, LedgerError> {
        self.inner.last_committed(consumer_group, partition).await
    }

    async fn commit(&self, offset: &ConsumerOffset) -> Result<(), LedgerError> {
        if self.commits.fetch_add(1, Ordering::SeqCst) == self.fail_at {
            return Err(LedgerError::Unavailable("crashed before commit".to_owned()));
        }
        self.inner.commit(offset).await
    }
}

/// Ledger that rejects every commit for one partition.
pub struct PartitionDownLedger {
    pub inner: Arc<MemoryOffsetLedger>,
    pub down: Partition,
}

#[async_trait]
impl OffsetLedger for PartitionDownLedger {
    async fn last_committed(
        &self,
        consumer_group: &str,
        partition: &Partition,
    ) -> Result<Option<i64>, LedgerError> {
        self.inner.last_committed(consumer_group, partition).await
    }

    async fn commit(&self, offset: &ConsumerOffset) -> Result<(), LedgerError> {
        if offset.topic == self.down.topic() && offset.partition == self.down.partition_number() {
            return Err(LedgerError::Unavailable("partition ledger down".to_owned()));
        }
        self.inner.commit(offset).await
    }
}
