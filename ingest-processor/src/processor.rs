use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ingest_common::dead_letter::{DeadLetterRouter, Failure};
use ingest_common::event::ProductEvent;
use ingest_common::ledger::ConsumerOffset;
use ingest_common::log::LogMessage;
use ingest_common::metrics_consts::{
    PRICE_CHANGES_COUNTER, PROCESSOR_APPLY_DURATION_HISTOGRAM, PROCESSOR_EVENTS_COUNTER,
    PROCESSOR_EVENT_LAG_HISTOGRAM, PROCESSOR_RETRIES_COUNTER,
};
use ingest_common::retry::RetryPolicy;
use ingest_common::store::{CanonicalStore, StoreError, UpsertChange};
use ingest_common::time::TimeSource;

use crate::idempotency::IdempotencyCache;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// What became of a message. Every variant but `Abandoned` lets the partition move on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Applied(UpsertChange),
    /// The idempotency cache had already seen the event id.
    Skipped,
    DeadLettered { published: bool },
    /// Cancelled between attempts. The offset must not advance: the message
    /// belongs to whoever owns the partition now.
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub disposition: Disposition,
    /// The offset was made durable together with the store write.
    pub offset_recorded: bool,
}

impl ProcessOutcome {
    fn unrecorded(disposition: Disposition) -> Self {
        Self {
            disposition,
            offset_recorded: false,
        }
    }
}

/// Running totals across every partition this process handles.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    processed: AtomicU64,
    duplicates: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub dead_lettered: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessorSettings {
    pub max_attempts: u32,
    pub apply_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            apply_timeout: DEFAULT_APPLY_TIMEOUT,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Applies one event at a time to the canonical store, at most once per event id.
///
/// Decoding failures and events that exhaust their attempts go to the
/// dead-letter topic. Nothing here returns an error: the caller always gets a
/// disposition and moves the partition forward.
pub struct IdempotentProcessor {
    store: Arc<dyn CanonicalStore>,
    cache: IdempotencyCache,
    dead_letter: DeadLetterRouter,
    consumer_group: String,
    settings: ProcessorSettings,
    clock: Arc<dyn TimeSource>,
    stats: ConsumerStats,
}

impl IdempotentProcessor {
    pub fn new(
        store: Arc<dyn CanonicalStore>,
        cache: IdempotencyCache,
        dead_letter: DeadLetterRouter,
        consumer_group: String,
        settings: ProcessorSettings,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            store,
            cache,
            dead_letter,
            consumer_group,
            settings: ProcessorSettings {
                max_attempts: settings.max_attempts.max(1),
                ..settings
            },
            clock,
            stats: ConsumerStats::default(),
        }
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn process(&self, message: &LogMessage) -> ProcessOutcome {
        self.process_until(message, &CancellationToken::new()).await
    }

    /// Like `process`, but gives up between attempts once `cancel` fires,
    /// so a fenced worker never retries into a partition it no longer owns.
    pub async fn process_until(
        &self,
        message: &LogMessage,
        cancel: &CancellationToken,
    ) -> ProcessOutcome {
        let event = match ProductEvent::from_bytes(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                ConsumerStats::incr(&self.stats.failed);
                let failure = Failure {
                    error_type: e.error_type().to_owned(),
                    error_message: e.to_string(),
                    retry_count: 0,
                    event_id: None,
                    source: None,
                };
                return self.dead_letter(message, failure).await;
            }
        };
        let offset = ConsumerOffset::new(&self.consumer_group, &message.partition, message.offset);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            let result =
                tokio::time::timeout(self.settings.apply_timeout, self.attempt(&event, &offset))
                    .await;
            histogram!(PROCESSOR_APPLY_DURATION_HISTOGRAM).record(started.elapsed().as_secs_f64());

            let error = match result {
                Ok(Ok(outcome)) => return outcome,
                Ok(Err(e)) if !e.is_retryable() => {
                    ConsumerStats::incr(&self.stats.failed);
                    return self
                        .dead_letter(message, self.failure(&event, "store_rejected", &e, attempt))
                        .await;
                }
                Ok(Err(e)) => e,
                Err(_) => StoreError::Unavailable(format!(
                    "apply timed out after {:?}",
                    self.settings.apply_timeout
                )),
            };

            if attempt >= self.settings.max_attempts {
                ConsumerStats::incr(&self.stats.failed);
                return self
                    .dead_letter(
                        message,
                        self.failure(&event, "retries_exhausted", &error, attempt),
                    )
                    .await;
            }

            let backoff = self.settings.retry_policy.time_until_next_retry(attempt - 1);
            warn!(
                partition = %message.partition,
                offset = message.offset,
                attempt,
                error = %error,
                "failed to apply event, retrying in {:?}",
                backoff
            );
            counter!(PROCESSOR_RETRIES_COUNTER).increment(1);
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(
                        partition = %message.partition,
                        offset = message.offset,
                        attempt,
                        "abandoning event, partition was revoked"
                    );
                    counter!(PROCESSOR_EVENTS_COUNTER, "outcome" => "abandoned").increment(1);
                    return ProcessOutcome::unrecorded(Disposition::Abandoned);
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    /// Cache check, then the store transaction, then mark the event processed.
    async fn attempt(
        &self,
        event: &ProductEvent,
        offset: &ConsumerOffset,
    ) -> Result<ProcessOutcome, StoreError> {
        if self.cache.was_processed(&event.event_id).await {
            debug!(event_id = %event.event_id, "skipping already processed event");
            ConsumerStats::incr(&self.stats.duplicates);
            counter!(PROCESSOR_EVENTS_COUNTER, "outcome" => "skipped").increment(1);
            return Ok(ProcessOutcome::unrecorded(Disposition::Skipped));
        }

        let outcome = self.store.apply(event, offset, self.clock.now()).await?;
        self.cache.mark_processed(&event.event_id).await;

        match outcome.change {
            UpsertChange::AlreadyApplied => {
                ConsumerStats::incr(&self.stats.duplicates);
                counter!(PROCESSOR_EVENTS_COUNTER, "outcome" => "skipped").increment(1);
            }
            UpsertChange::Inserted | UpsertChange::Updated { .. } => {
                ConsumerStats::incr(&self.stats.processed);
                counter!(PROCESSOR_EVENTS_COUNTER, "outcome" => "applied").increment(1);
                let lag_ms = self.clock.now_millis().saturating_sub(event.occurred_at);
                histogram!(PROCESSOR_EVENT_LAG_HISTOGRAM).record(lag_ms.max(0) as f64 / 1000.0);
            }
        }
        if let UpsertChange::Updated {
            history_appended: true,
        } = outcome.change
        {
            counter!(PRICE_CHANGES_COUNTER).increment(1);
        }

        Ok(ProcessOutcome {
            disposition: Disposition::Applied(outcome.change),
            offset_recorded: outcome.offset_recorded,
        })
    }

    fn failure(
        &self,
        event: &ProductEvent,
        error_type: &str,
        error: &StoreError,
        attempts: u32,
    ) -> Failure {
        Failure {
            error_type: error_type.to_owned(),
            error_message: error.to_string(),
            retry_count: attempts,
            event_id: Some(event.event_id),
            source: Some(event.source.clone()),
        }
    }

    async fn dead_letter(&self, message: &LogMessage, failure: Failure) -> ProcessOutcome {
        ConsumerStats::incr(&self.stats.dead_lettered);
        counter!(PROCESSOR_EVENTS_COUNTER, "outcome" => "dead_lettered").increment(1);
        let published = self.dead_letter.route(message, failure).await;
        ProcessOutcome::unrecorded(Disposition::DeadLettered { published })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_common::cache::MockRedisClient;
    use ingest_common::dead_letter::DeadLetterRecord;
    use ingest_common::event::CandidateRecord;
    use ingest_common::log::memory::MemoryLog;
    use ingest_common::log::Partition;
    use ingest_common::store::MemoryStore;
    use ingest_common::time::FixedTime;
    use uuid::Uuid;

    struct Harness {
        store: Arc<MemoryStore>,
        cache: MockRedisClient,
        log: MemoryLog,
        processor: IdempotentProcessor,
    }

    fn harness(settings: ProcessorSettings) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let cache = MockRedisClient::new();
        let log = MemoryLog::new(1);
        let clock = Arc::new(FixedTime::from_millis(1_700_000_000_000));
        let processor = IdempotentProcessor::new(
            store.clone(),
            IdempotencyCache::new(Arc::new(cache.clone()), 60),
            DeadLetterRouter::new(
                Arc::new(log.clone()),
                "dead-letter-queue".to_string(),
                Duration::from_millis(100),
                clock.clone(),
            ),
            "processor".to_string(),
            settings,
            clock,
        );
        Harness {
            store,
            cache,
            log,
            processor,
        }
    }

    fn message(offset: i64, payload: Vec<u8>) -> LogMessage {
        LogMessage {
            partition: Partition::new("product-events", 0),
            offset,
            key: Some("shopA".to_string()),
            payload,
        }
    }

    fn deck_x() -> ProductEvent {
        let record: CandidateRecord = serde_json::from_value(serde_json::json!({
            "external_id": "123",
            "title": "Deck X",
            "sale_price": "39.99",
            "product_url": "https://shop-a.example/decks/123",
        }))
        .unwrap();
        ProductEvent::new(record.normalize("shopA").unwrap(), Uuid::now_v7(), 0)
    }

    fn fast_retries() -> ProcessorSettings {
        ProcessorSettings {
            retry_policy: RetryPolicy::immediate(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn applies_then_skips_redelivery() {
        let h = harness(fast_retries());
        let event = deck_x();
        let bytes = event.to_bytes().unwrap();

        let first = h.processor.process(&message(0, bytes.clone())).await;
        assert_eq!(
            first.disposition,
            Disposition::Applied(UpsertChange::Inserted)
        );
        assert!(h
            .cache
            .contains(&format!("ingest:processed:{}", event.event_id)));

        let second = h.processor.process(&message(0, bytes)).await;
        assert_eq!(second.disposition, Disposition::Skipped);
        assert_eq!(h.store.applies(), 1);
        assert_eq!(
            h.processor.stats(),
            StatsSnapshot {
                processed: 1,
                duplicates: 1,
                failed: 0,
                dead_lettered: 0
            }
        );
    }

    #[tokio::test]
    async fn store_guard_catches_redelivery_after_cache_loss() {
        let h = harness(fast_retries());
        let bytes = deck_x().to_bytes().unwrap();

        h.processor.process(&message(0, bytes.clone())).await;
        h.cache.clear();
        let outcome = h.processor.process(&message(0, bytes)).await;

        assert_eq!(
            outcome.disposition,
            Disposition::Applied(UpsertChange::AlreadyApplied)
        );
        assert_eq!(h.store.applies(), 1);
    }

    #[tokio::test]
    async fn malformed_payload_is_dead_lettered_without_retries() {
        let h = harness(fast_retries());
        let outcome = h.processor.process(&message(7, b"{oops".to_vec())).await;

        assert_eq!(
            outcome,
            ProcessOutcome {
                disposition: Disposition::DeadLettered { published: true },
                offset_recorded: false
            }
        );
        let quarantined = h.log.messages("dead-letter-queue");
        assert_eq!(quarantined.len(), 1);
        let record: DeadLetterRecord = serde_json::from_slice(&quarantined[0].payload).unwrap();
        assert_eq!(record.error_type, "malformed_payload");
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.offset, 7);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let h = harness(fast_retries());
        h.store.fail_next("123", 2, true);

        let outcome = h
            .processor
            .process(&message(0, deck_x().to_bytes().unwrap()))
            .await;
        assert_eq!(
            outcome.disposition,
            Disposition::Applied(UpsertChange::Inserted)
        );
        assert!(h.log.messages("dead-letter-queue").is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_are_dead_lettered() {
        let h = harness(fast_retries());
        h.store.fail_next("123", 10, true);
        let event = deck_x();

        let outcome = h.processor.process(&message(3, event.to_bytes().unwrap())).await;
        assert_eq!(
            outcome.disposition,
            Disposition::DeadLettered { published: true }
        );
        assert!(h.store.products().is_empty());

        let quarantined = h.log.messages("dead-letter-queue");
        let record: DeadLetterRecord = serde_json::from_slice(&quarantined[0].payload).unwrap();
        assert_eq!(record.error_type, "retries_exhausted");
        assert_eq!(record.retry_count, 3);
        assert_eq!(record.event_id, Some(event.event_id));
        assert_eq!(record.source.as_deref(), Some("shopA"));
    }

    #[tokio::test]
    async fn rejected_writes_skip_the_retry_budget() {
        let h = harness(fast_retries());
        h.store.fail_next("123", 1, false);

        let outcome = h
            .processor
            .process(&message(0, deck_x().to_bytes().unwrap()))
            .await;
        assert_eq!(
            outcome.disposition,
            Disposition::DeadLettered { published: true }
        );
        // The single injected failure was consumed by the only attempt
        assert!(h.store.products().is_empty());
    }

    #[tokio::test]
    async fn slow_applies_count_against_the_budget() {
        let h = harness(ProcessorSettings {
            max_attempts: 2,
            apply_timeout: Duration::from_millis(20),
            retry_policy: RetryPolicy::immediate(),
        });
        h.store.set_apply_delay(Some(Duration::from_secs(5)));

        let outcome = h
            .processor
            .process(&message(0, deck_x().to_bytes().unwrap()))
            .await;
        assert_eq!(
            outcome.disposition,
            Disposition::DeadLettered { published: true }
        );
        assert!(h.store.products().is_empty());
    }

    #[tokio::test]
    async fn revoked_partition_stops_retrying() {
        let h = harness(ProcessorSettings {
            max_attempts: 10,
            apply_timeout: Duration::from_secs(1),
            retry_policy: RetryPolicy::new(1, Duration::from_secs(30), None),
        });
        h.store.fail_next("123", 10, true);
        let cancel = CancellationToken::new();
        let fence = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            fence.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            h.processor
                .process_until(&message(0, deck_x().to_bytes().unwrap()), &cancel),
        )
        .await
        .expect("retries kept going after the partition was revoked");

        assert_eq!(outcome.disposition, Disposition::Abandoned);
        assert!(!outcome.offset_recorded);
        assert!(h.store.products().is_empty());
        assert!(h.log.messages("dead-letter-queue").is_empty());
        assert_eq!(h.processor.stats().dead_lettered, 0);
    }

    #[tokio::test]
    async fn unreachable_cache_still_applies_once() {
        let h = harness(fast_retries());
        let cache = MockRedisClient::unreachable();
        let processor = IdempotentProcessor::new(
            h.store.clone(),
            IdempotencyCache::new(Arc::new(cache), 60),
            DeadLetterRouter::new(
                Arc::new(h.log.clone()),
                "dead-letter-queue".to_string(),
                Duration::from_millis(100),
                Arc::new(FixedTime::from_millis(0)),
            ),
            "processor".to_string(),
            fast_retries(),
            Arc::new(FixedTime::from_millis(0)),
        );
        let bytes = deck_x().to_bytes().unwrap();

        processor.process(&message(0, bytes.clone())).await;
        let outcome = processor.process(&message(0, bytes)).await;
        assert_eq!(
            outcome.disposition,
            Disposition::Applied(UpsertChange::AlreadyApplied)
        );
        assert_eq!(h.store.applies(), 1);
    }
}
