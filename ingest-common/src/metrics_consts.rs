// ==== Publisher metrics ====
/// Counter for events committed to the product events topic
pub const EVENTS_PUBLISHED_COUNTER: &str = "ingest_events_published_total";

/// Counter for candidate records suppressed by a fingerprint hit (label: scope=batch|store)
pub const PUBLISH_DUPLICATES_COUNTER: &str = "ingest_publish_duplicates_total";

/// Counter for candidate records that failed validation or whose batch failed (label: reason)
pub const PUBLISH_FAILED_COUNTER: &str = "ingest_publish_failed_total";

/// Histogram for the time between enlisting an event and the transaction commit ack
pub const PUBLISH_ACK_LATENCY_HISTOGRAM: &str = "ingest_publish_ack_latency_seconds";

/// Histogram for events per committed batch
pub const PUBLISH_BATCH_SIZE_HISTOGRAM: &str = "ingest_publish_batch_size_events";

/// Counter for fingerprint store errors, which fail open (label: op=exists|set)
pub const FINGERPRINT_STORE_ERRORS_COUNTER: &str = "ingest_fingerprint_store_errors_total";

// ==== Processor metrics ====
/// Counter for events handled by the processor (label: outcome=applied|skipped|dead_lettered)
pub const PROCESSOR_EVENTS_COUNTER: &str = "ingest_processor_events_total";

/// Counter for failed apply attempts that will be retried
pub const PROCESSOR_RETRIES_COUNTER: &str = "ingest_processor_retries_total";

/// Histogram for the duration of a single event's idempotency check, upsert and offset write
pub const PROCESSOR_APPLY_DURATION_HISTOGRAM: &str = "ingest_processor_apply_duration_seconds";

/// Histogram for the time between publish and apply
pub const PROCESSOR_EVENT_LAG_HISTOGRAM: &str = "ingest_processor_event_lag_seconds";

/// Counter for price history rows appended
pub const PRICE_CHANGES_COUNTER: &str = "ingest_price_changes_total";

/// Counter for idempotency cache errors, the store guard takes over (label: op=exists|set)
pub const IDEMPOTENCY_CACHE_ERRORS_COUNTER: &str = "ingest_idempotency_cache_errors_total";

/// Gauge for the last offset committed to the ledger (labels: topic, partition)
pub const LEDGER_COMMITTED_OFFSET_GAUGE: &str = "ingest_ledger_committed_offset";

/// Counter for ledger read or write failures, each one stops a partition worker
pub const LEDGER_FAILURES_COUNTER: &str = "ingest_ledger_failures_total";

/// Gauge for the number of running partition workers
pub const ACTIVE_PARTITION_WORKERS_GAUGE: &str = "ingest_active_partition_workers";

/// Counter for partition assignment changes (label: kind=assign|revoke)
pub const REBALANCE_EVENTS_COUNTER: &str = "ingest_rebalance_events_total";

// ==== Dead-letter metrics ====
/// Counter for records written to the quarantine topic (label: error_type)
pub const DEAD_LETTER_PUBLISHED_COUNTER: &str = "ingest_dead_letter_published_total";

/// Counter for quarantine publishes that failed, the event is lost from the pipeline
pub const DEAD_LETTER_PUBLISH_FAILURES_COUNTER: &str = "ingest_dead_letter_publish_failures_total";

// ==== Kafka client metrics ====
/// Gauge for messages waiting in the producer queue
pub const KAFKA_PRODUCER_QUEUE_DEPTH_GAUGE: &str = "ingest_kafka_producer_queue_depth";

/// Gauge for the producer queue limit
pub const KAFKA_PRODUCER_QUEUE_DEPTH_LIMIT_GAUGE: &str = "ingest_kafka_producer_queue_depth_limit";

/// Gauge for requests waiting to be sent per broker (label: broker)
pub const KAFKA_BROKER_REQUESTS_PENDING_GAUGE: &str = "ingest_kafka_broker_requests_pending";

/// Counter for transmission errors per broker (label: broker)
pub const KAFKA_BROKER_TX_ERRORS_COUNTER: &str = "ingest_kafka_broker_tx_errors_total";
