use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use crate::log::Partition;

/// Progress of a consumer group on one partition: the last offset whose
/// effects are durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOffset {
    pub consumer_group: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl ConsumerOffset {
    pub fn new(consumer_group: &str, partition: &Partition, offset: i64) -> Self {
        Self {
            consumer_group: consumer_group.to_owned(),
            topic: partition.topic().to_owned(),
            partition: partition.partition_number(),
            offset,
        }
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("connection to the offset ledger failed: {0}")]
    ConnectionError(sqlx::Error),
    #[error("{command} query on the offset ledger failed: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("offset ledger is unavailable: {0}")]
    Unavailable(String),
}

/// The single authority on where a partition resumes.
///
/// Implementations never move a committed offset backwards: committing an
/// offset at or below the current one is a no-op.
#[async_trait]
pub trait OffsetLedger: Send + Sync {
    async fn last_committed(
        &self,
        consumer_group: &str,
        partition: &Partition,
    ) -> Result<Option<i64>, LedgerError>;

    async fn commit(&self, offset: &ConsumerOffset) -> Result<(), LedgerError>;
}

const UPSERT_OFFSET: &str = r#"
INSERT INTO consumer_offsets (consumer_group, topic, partition, last_offset, updated_at)
VALUES ($1, $2, $3, $4, NOW())
ON CONFLICT (consumer_group, topic, partition) DO UPDATE
SET last_offset = EXCLUDED.last_offset, updated_at = EXCLUDED.updated_at
WHERE consumer_offsets.last_offset < EXCLUDED.last_offset
"#;

/// Monotonic offset upsert, usable inside a caller's transaction.
pub async fn record_offset<'c, E>(executor: E, offset: &ConsumerOffset) -> Result<(), sqlx::Error>
where
    E: sqlx::PgExecutor<'c>,
{
    sqlx::query(UPSERT_OFFSET)
        .bind(&offset.consumer_group)
        .bind(&offset.topic)
        .bind(offset.partition)
        .bind(offset.offset)
        .execute(executor)
        .await?;
    Ok(())
}

/// Offset ledger in the `consumer_offsets` table, next to the canonical store.
#[derive(Clone)]
pub struct PgOffsetLedger {
    pool: PgPool,
}

impl PgOffsetLedger {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(LedgerError::ConnectionError)?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OffsetLedger for PgOffsetLedger {
    async fn last_committed(
        &self,
        consumer_group: &str,
        partition: &Partition,
    ) -> Result<Option<i64>, LedgerError> {
        sqlx::query_scalar::<_, i64>(
            r#"
SELECT last_offset FROM consumer_offsets
WHERE consumer_group = $1 AND topic = $2 AND partition = $3
            "#,
        )
        .bind(consumer_group)
        .bind(partition.topic())
        .bind(partition.partition_number())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| LedgerError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })
    }

    async fn commit(&self, offset: &ConsumerOffset) -> Result<(), LedgerError> {
        record_offset(&self.pool, offset)
            .await
            .map_err(|error| LedgerError::QueryError {
                command: "UPSERT".to_owned(),
                error,
            })
    }
}

type LedgerKey = (String, String, i32);

/// In-memory ledger for tests, with switches to simulate an unreachable database.
#[derive(Default)]
pub struct MemoryOffsetLedger {
    offsets: Mutex<HashMap<LedgerKey, i64>>,
    commits: Mutex<Vec<ConsumerOffset>>,
    fail_reads: AtomicBool,
    fail_commits: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MemoryOffsetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, consumer_group: &str, partition: &Partition) -> Option<i64> {
        lock(&self.offsets)
            .get(&(
                consumer_group.to_owned(),
                partition.topic().to_owned(),
                partition.partition_number(),
            ))
            .copied()
    }

    /// Every accepted commit, in call order, including no-op ones.
    pub fn commits(&self) -> Vec<ConsumerOffset> {
        lock(&self.commits).clone()
    }

    /// Applies the commit without failure injection, for stores that record
    /// the offset in their own unit of work.
    pub fn record(&self, offset: &ConsumerOffset) {
        lock(&self.commits).push(offset.clone());
        let mut offsets = lock(&self.offsets);
        let current = offsets
            .entry((
                offset.consumer_group.clone(),
                offset.topic.clone(),
                offset.partition,
            ))
            .or_insert(offset.offset);
        *current = (*current).max(offset.offset);
    }
}

#[async_trait]
impl OffsetLedger for MemoryOffsetLedger {
    async fn last_committed(
        &self,
        consumer_group: &str,
        partition: &Partition,
    ) -> Result<Option<i64>, LedgerError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("reads disabled".to_owned()));
        }
        Ok(self.get(consumer_group, partition))
    }

    async fn commit(&self, offset: &ConsumerOffset) -> Result<(), LedgerError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("commits disabled".to_owned()));
        }
        self.record(offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition() -> Partition {
        Partition::new("product-events", 2)
    }

    #[tokio::test]
    async fn memory_ledger_never_moves_backwards() {
        let ledger = MemoryOffsetLedger::new();
        assert_eq!(ledger.last_committed("g", &partition()).await.unwrap(), None);

        for offset in [3, 7, 5] {
            ledger
                .commit(&ConsumerOffset::new("g", &partition(), offset))
                .await
                .unwrap();
        }
        assert_eq!(
            ledger.last_committed("g", &partition()).await.unwrap(),
            Some(7)
        );
        // Groups are tracked independently
        assert_eq!(ledger.last_committed("h", &partition()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_ledger_failures() {
        let ledger = MemoryOffsetLedger::new();
        ledger.fail_commits(true);
        assert!(ledger
            .commit(&ConsumerOffset::new("g", &partition(), 1))
            .await
            .is_err());
        assert_eq!(ledger.get("g", &partition()), None);

        ledger.fail_reads(true);
        assert!(ledger.last_committed("g", &partition()).await.is_err());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn pg_ledger_is_monotonic(db: PgPool) {
        let ledger = PgOffsetLedger::from_pool(db);
        assert_eq!(ledger.last_committed("g", &partition()).await.unwrap(), None);

        ledger
            .commit(&ConsumerOffset::new("g", &partition(), 10))
            .await
            .expect("failed to commit offset");
        ledger
            .commit(&ConsumerOffset::new("g", &partition(), 4))
            .await
            .expect("failed to commit stale offset");
        assert_eq!(
            ledger.last_committed("g", &partition()).await.unwrap(),
            Some(10)
        );

        ledger
            .commit(&ConsumerOffset::new("g", &partition(), 11))
            .await
            .expect("failed to commit offset");
        assert_eq!(
            ledger.last_committed("g", &partition()).await.unwrap(),
            Some(11)
        );
    }
}
