use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use crate::log::{LogAppender, LogMessage, LogRecord};
use crate::metrics_consts::{DEAD_LETTER_PUBLISHED_COUNTER, DEAD_LETTER_PUBLISH_FAILURES_COUNTER};
use crate::time::TimeSource;

/// What lands on the quarantine topic for out-of-band remediation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub original_topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    /// Original bytes, lossily decoded so malformed payloads stay inspectable
    pub raw_payload: String,
    pub error_type: String,
    pub error_message: String,
    pub retry_count: u32,
    /// Epoch milliseconds
    pub failed_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// The terminal failure of an event, as reported by the processor.
#[derive(Debug, Clone)]
pub struct Failure {
    pub error_type: String,
    pub error_message: String,
    pub retry_count: u32,
    pub event_id: Option<Uuid>,
    pub source: Option<String>,
}

/// Publishes poison messages to the quarantine topic.
///
/// One publish attempt, bounded by `publish_timeout`. A failed publish is
/// logged and counted, never returned: the partition keeps moving.
pub struct DeadLetterRouter {
    log: Arc<dyn LogAppender>,
    topic: String,
    publish_timeout: Duration,
    clock: Arc<dyn TimeSource>,
}

impl DeadLetterRouter {
    pub fn new(
        log: Arc<dyn LogAppender>,
        topic: String,
        publish_timeout: Duration,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            log,
            topic,
            publish_timeout,
            clock,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns true if the record reached the quarantine topic.
    pub async fn route(&self, message: &LogMessage, failure: Failure) -> bool {
        let record = DeadLetterRecord {
            original_topic: message.partition.topic().to_owned(),
            partition: message.partition.partition_number(),
            offset: message.offset,
            key: message.key.clone(),
            raw_payload: String::from_utf8_lossy(&message.payload).into_owned(),
            error_type: failure.error_type,
            error_message: failure.error_message,
            retry_count: failure.retry_count,
            failed_at: self.clock.now_millis(),
            event_id: failure.event_id,
            source: failure.source,
        };
        let error_type = record.error_type.clone();

        let payload = match serde_json::to_vec(&record) {
            Ok(payload) => payload,
            Err(e) => {
                error!(partition = %message.partition, offset = message.offset, "failed to serialize dead-letter record: {}", e);
                counter!(DEAD_LETTER_PUBLISH_FAILURES_COUNTER).increment(1);
                return false;
            }
        };

        let append = self.log.append(
            &self.topic,
            LogRecord {
                key: message.key.clone(),
                payload,
            },
        );
        match tokio::time::timeout(self.publish_timeout, append).await {
            Ok(Ok(_)) => {
                warn!(
                    partition = %message.partition,
                    offset = message.offset,
                    error_type = %error_type,
                    retry_count = record.retry_count,
                    "event dead-lettered: {}",
                    record.error_message
                );
                counter!(DEAD_LETTER_PUBLISHED_COUNTER, "error_type" => error_type).increment(1);
                true
            }
            Ok(Err(e)) => {
                error!(
                    partition = %message.partition,
                    offset = message.offset,
                    error_type = %error_type,
                    "failed to publish dead-letter record, event dropped from the pipeline: {}",
                    e
                );
                counter!(DEAD_LETTER_PUBLISH_FAILURES_COUNTER).increment(1);
                false
            }
            Err(_) => {
                error!(
                    partition = %message.partition,
                    offset = message.offset,
                    error_type = %error_type,
                    "timed out publishing dead-letter record, event dropped from the pipeline"
                );
                counter!(DEAD_LETTER_PUBLISH_FAILURES_COUNTER).increment(1);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::memory::MemoryLog;
    use crate::log::Partition;
    use crate::time::FixedTime;

    fn router(log: &MemoryLog) -> DeadLetterRouter {
        DeadLetterRouter::new(
            Arc::new(log.clone()),
            "dead-letter-queue".to_string(),
            Duration::from_millis(100),
            Arc::new(FixedTime::from_millis(1_700_000_000_000)),
        )
    }

    fn poison() -> LogMessage {
        LogMessage {
            partition: Partition::new("product-events", 3),
            offset: 42,
            key: Some("shopA".to_string()),
            payload: b"{\"event_id\": 12".to_vec(),
        }
    }

    fn failure() -> Failure {
        Failure {
            error_type: "malformed_payload".to_string(),
            error_message: "EOF while parsing an object".to_string(),
            retry_count: 0,
            event_id: None,
            source: None,
        }
    }

    #[tokio::test]
    async fn routes_annotated_record() {
        let log = MemoryLog::new(1);
        assert!(router(&log).route(&poison(), failure()).await);

        let quarantined = log.messages("dead-letter-queue");
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].key.as_deref(), Some("shopA"));

        let record: DeadLetterRecord = serde_json::from_slice(&quarantined[0].payload).unwrap();
        assert_eq!(record.original_topic, "product-events");
        assert_eq!(record.partition, 3);
        assert_eq!(record.offset, 42);
        assert_eq!(record.raw_payload, "{\"event_id\": 12");
        assert_eq!(record.error_type, "malformed_payload");
        assert_eq!(record.failed_at, 1_700_000_000_000);
    }

    #[tokio::test]
    async fn publish_failure_is_swallowed() {
        let log = MemoryLog::new(1);
        log.set_unavailable(true);
        assert!(!router(&log).route(&poison(), failure()).await);
        assert!(log.messages("dead-letter-queue").is_empty());
    }

    #[tokio::test]
    async fn publish_is_bounded_by_timeout() {
        let log = MemoryLog::new(1);
        log.set_append_delay(Some(Duration::from_secs(5)));
        assert!(!router(&log).route(&poison(), failure()).await);
    }
}
