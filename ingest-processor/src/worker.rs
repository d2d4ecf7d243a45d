use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use metrics::{counter, gauge};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use ingest_common::ledger::{ConsumerOffset, OffsetLedger};
use ingest_common::log::{Partition, PartitionReader};
use ingest_common::metrics_consts::{
    ACTIVE_PARTITION_WORKERS_GAUGE, LEDGER_COMMITTED_OFFSET_GAUGE, LEDGER_FAILURES_COUNTER,
};

use crate::error::WorkerError;
use crate::processor::{Disposition, IdempotentProcessor};

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub poll_timeout: Duration,
    /// Where to start when the ledger has no offset for the partition.
    pub subscription_start: i64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            poll_timeout: Duration::from_secs(1),
            subscription_start: 0,
        }
    }
}

/// Sole consumer of one partition.
///
/// Resumes from the offset ledger, never from the log's group offsets, and
/// handles messages strictly in log order. The ledger is committed after every
/// message; a ledger failure stops the worker so it never runs ahead of what
/// is durable.
pub struct PartitionWorker {
    partition: Partition,
    reader: Box<dyn PartitionReader>,
    processor: Arc<IdempotentProcessor>,
    ledger: Arc<dyn OffsetLedger>,
    settings: WorkerSettings,
    cancel: CancellationToken,
    liveness: Option<HealthHandle>,
}

impl PartitionWorker {
    pub fn new(
        reader: Box<dyn PartitionReader>,
        processor: Arc<IdempotentProcessor>,
        ledger: Arc<dyn OffsetLedger>,
        settings: WorkerSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            partition: reader.partition().clone(),
            reader,
            processor,
            ledger,
            settings,
            cancel,
            liveness: None,
        }
    }

    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Runs until cancelled. Returns the last committed offset, if any.
    pub async fn run(mut self) -> Result<Option<i64>, WorkerError> {
        gauge!(ACTIVE_PARTITION_WORKERS_GAUGE).increment(1.0);
        let result = self.consume().await;
        gauge!(ACTIVE_PARTITION_WORKERS_GAUGE).decrement(1.0);

        match &result {
            Ok(committed) => {
                info!(partition = %self.partition, committed = ?committed, "partition worker stopped")
            }
            Err(e) => {
                error!(partition = %self.partition, error = %e, "partition worker failed")
            }
        }
        result
    }

    async fn consume(&mut self) -> Result<Option<i64>, WorkerError> {
        let group = self.processor.consumer_group().to_owned();
        let mut committed = self
            .ledger
            .last_committed(&group, &self.partition)
            .await
            .map_err(|e| {
                counter!(LEDGER_FAILURES_COUNTER).increment(1);
                e
            })?;

        let start = committed
            .map(|offset| offset + 1)
            .unwrap_or(0)
            .max(self.settings.subscription_start);
        self.reader.seek(start).await?;
        info!(partition = %self.partition, start, "partition worker started");

        loop {
            if let Some(liveness) = &self.liveness {
                liveness.report_healthy().await;
            }

            let batch = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(committed),
                batch = self.reader.next_batch(self.settings.batch_size, self.settings.poll_timeout) => batch?,
            };

            for message in batch {
                // Fenced: the partition may already belong to another worker
                if self.cancel.is_cancelled() {
                    return Ok(committed);
                }
                if committed.is_some_and(|offset| message.offset <= offset) {
                    debug!(partition = %self.partition, offset = message.offset, "skipping committed offset");
                    continue;
                }

                let outcome = self.processor.process_until(&message, &self.cancel).await;
                if outcome.disposition == Disposition::Abandoned {
                    return Ok(committed);
                }
                if !outcome.offset_recorded {
                    let offset = ConsumerOffset::new(&group, &self.partition, message.offset);
                    self.ledger.commit(&offset).await.map_err(|e| {
                        counter!(LEDGER_FAILURES_COUNTER).increment(1);
                        e
                    })?;
                }
                committed = Some(message.offset);

                gauge!(
                    LEDGER_COMMITTED_OFFSET_GAUGE,
                    "topic" => self.partition.topic().to_owned(),
                    "partition" => self.partition.partition_number().to_string()
                )
                .set(message.offset as f64);
                self.reader.commit_hint(message.offset + 1);
            }
        }
    }
}
