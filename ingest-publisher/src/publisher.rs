use std::collections::HashSet;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

use ingest_common::event::{CandidateRecord, ProductEvent};
use ingest_common::log::{LogError, LogRecord, TransactionalLog};
use ingest_common::metrics_consts::{
    EVENTS_PUBLISHED_COUNTER, PUBLISH_ACK_LATENCY_HISTOGRAM, PUBLISH_BATCH_SIZE_HISTOGRAM,
    PUBLISH_DUPLICATES_COUNTER, PUBLISH_FAILED_COUNTER,
};
use ingest_common::time::TimeSource;

use crate::fingerprint::FingerprintStore;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-call accounting: every input record lands in exactly one bucket.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishSummary {
    pub success: usize,
    pub duplicates: usize,
    pub failed: usize,
}

impl PublishSummary {
    pub fn total(&self) -> usize {
        self.success + self.duplicates + self.failed
    }
}

impl AddAssign for PublishSummary {
    fn add_assign(&mut self, other: Self) {
        self.success += other.success;
        self.duplicates += other.duplicates;
        self.failed += other.failed;
    }
}

#[derive(Error, Debug)]
enum PublishError {
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("timed out after {0:?} appending the batch")]
    Timeout(Duration),
}

/// An event waiting for its batch to commit.
struct Enlisted {
    fingerprint: String,
    enqueued_at: Instant,
}

pub struct EventPublisher {
    log: Arc<dyn TransactionalLog>,
    fingerprints: FingerprintStore,
    topic: String,
    batch_size: usize,
    batch_timeout: Duration,
    clock: Arc<dyn TimeSource>,
}

impl EventPublisher {
    pub fn new(
        log: Arc<dyn TransactionalLog>,
        fingerprints: FingerprintStore,
        topic: String,
        batch_size: usize,
        batch_timeout: Duration,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            log,
            fingerprints,
            topic,
            batch_size: batch_size.max(1),
            batch_timeout,
            clock,
        }
    }

    /// Publish the records of one source, in order, one transaction per batch.
    ///
    /// A failed batch is counted and skipped, batches before it stay committed.
    pub async fn publish(&self, source: &str, records: Vec<CandidateRecord>) -> PublishSummary {
        let mut summary = PublishSummary::default();
        let mut records = records.into_iter();

        loop {
            let batch: Vec<CandidateRecord> = records.by_ref().take(self.batch_size).collect();
            if batch.is_empty() {
                break;
            }
            summary += self.publish_batch(source, batch).await;
        }

        info!(
            source,
            success = summary.success,
            duplicates = summary.duplicates,
            failed = summary.failed,
            "publish finished"
        );
        summary
    }

    async fn publish_batch(&self, source: &str, batch: Vec<CandidateRecord>) -> PublishSummary {
        let mut summary = PublishSummary::default();
        let mut in_batch = HashSet::with_capacity(batch.len());
        let mut enlisted = Vec::with_capacity(batch.len());
        let mut records = Vec::with_capacity(batch.len());

        for candidate in batch {
            let normalized = match candidate.normalize(source) {
                Ok(normalized) => normalized,
                Err(e) => {
                    debug!(source, error = %e, "rejecting candidate record");
                    counter!(PUBLISH_FAILED_COUNTER, "reason" => e.error_type()).increment(1);
                    summary.failed += 1;
                    continue;
                }
            };

            if !in_batch.insert(normalized.fingerprint.clone()) {
                counter!(PUBLISH_DUPLICATES_COUNTER, "scope" => "batch").increment(1);
                summary.duplicates += 1;
                continue;
            }
            if self.fingerprints.seen(&normalized.fingerprint).await {
                counter!(PUBLISH_DUPLICATES_COUNTER, "scope" => "store").increment(1);
                summary.duplicates += 1;
                continue;
            }

            let fingerprint = normalized.fingerprint.clone();
            let event = ProductEvent::new(normalized, Uuid::now_v7(), self.clock.now_millis());
            match event.to_bytes() {
                Ok(payload) => {
                    records.push(LogRecord {
                        key: Some(event.key().to_owned()),
                        payload,
                    });
                    enlisted.push(Enlisted {
                        fingerprint,
                        enqueued_at: Instant::now(),
                    });
                }
                Err(e) => {
                    error!(source, error = %e, "failed to serialize event");
                    counter!(PUBLISH_FAILED_COUNTER, "reason" => "serialization").increment(1);
                    summary.failed += 1;
                }
            }
        }

        if records.is_empty() {
            return summary;
        }

        let count = records.len();
        match self.append(records).await {
            Ok(()) => {
                summary.success += count;
                counter!(EVENTS_PUBLISHED_COUNTER).increment(count as u64);
                histogram!(PUBLISH_BATCH_SIZE_HISTOGRAM).record(count as f64);
                for event in &enlisted {
                    histogram!(PUBLISH_ACK_LATENCY_HISTOGRAM)
                        .record(event.enqueued_at.elapsed().as_secs_f64());
                }
                // Only committed events are remembered, a failed batch can be republished as is
                for event in &enlisted {
                    self.fingerprints.remember(&event.fingerprint).await;
                }
            }
            Err(e) => {
                error!(source, events = count, error = %e, "failed to publish batch");
                counter!(PUBLISH_FAILED_COUNTER, "reason" => "log").increment(count as u64);
                summary.failed += count;
            }
        }
        summary
    }

    async fn append(&self, records: Vec<LogRecord>) -> Result<(), PublishError> {
        let append = self.log.append_batch(&self.topic, records);
        match tokio::time::timeout(self.batch_timeout, append).await {
            Ok(positions) => {
                positions?;
                Ok(())
            }
            Err(_) => Err(PublishError::Timeout(self.batch_timeout)),
        }
    }
}
