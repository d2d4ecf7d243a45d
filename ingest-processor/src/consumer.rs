//! Consumer-group membership for the processor.
//!
//! The group protocol only decides which partitions this process owns. Events
//! are read by per-partition readers and progress comes from the offset
//! ledger, so the coordinator consumer never hands out messages: it pauses
//! whatever it gets assigned and only receives progress hints to commit.

use std::sync::Arc;
use std::time::Duration;

use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ingest_common::config::KafkaConfig;
use ingest_common::log::kafka::consumer_config;
use ingest_common::log::{Partition, ProgressHint};

use crate::supervisor::{AssignmentEvent, WorkerTokens};

pub struct AssignmentContext {
    tokens: WorkerTokens,
    events: mpsc::UnboundedSender<AssignmentEvent>,
}

impl AssignmentContext {
    pub fn new(tokens: WorkerTokens, events: mpsc::UnboundedSender<AssignmentEvent>) -> Self {
        Self { tokens, events }
    }

    fn send(&self, event: AssignmentEvent) {
        if let Err(e) = self.events.send(event) {
            error!("failed to forward assignment change to the supervisor: {}", e);
        }
    }
}

fn partitions(list: &TopicPartitionList) -> Vec<Partition> {
    list.elements().into_iter().map(Partition::from).collect()
}

impl ClientContext for AssignmentContext {}

impl ConsumerContext for AssignmentContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(list) => {
                if list.count() == 0 {
                    return;
                }
                let revoked = partitions(list);
                info!(count = revoked.len(), "revoking partitions");
                // Fence synchronously: no worker may start another event once the
                // group moves the partition elsewhere
                for partition in &revoked {
                    self.tokens.cancel(partition);
                }
                self.send(AssignmentEvent::Revoked(revoked));
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => error!("rebalance error: {}", e),
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(list) = rebalance {
            if list.count() == 0 {
                return;
            }
            let assigned = partitions(list);
            info!(count = assigned.len(), "assigned partitions");
            self.send(AssignmentEvent::Assigned(assigned));
        }
    }

    fn commit_callback(
        &self,
        result: rdkafka::error::KafkaResult<()>,
        offsets: &TopicPartitionList,
    ) {
        if let Err(e) = result {
            debug!(count = offsets.count(), "failed to commit progress hint: {}", e);
        }
    }
}

/// Group member subscribed to the product events topic.
pub struct ConsumerGroup {
    consumer: Arc<StreamConsumer<AssignmentContext>>,
}

impl ConsumerGroup {
    pub fn new(
        config: &KafkaConfig,
        group_id: &str,
        topic: &str,
        context: AssignmentContext,
    ) -> Result<Self, KafkaError> {
        let mut client_config = consumer_config(config, group_id);
        client_config.set("partition.assignment.strategy", "cooperative-sticky");

        let consumer: StreamConsumer<AssignmentContext> =
            client_config.create_with_context(context)?;
        consumer.subscribe(&[topic])?;

        Ok(Self {
            consumer: Arc::new(consumer),
        })
    }

    /// Sink for the partition readers' progress hints.
    pub fn progress(&self) -> GroupProgress {
        GroupProgress {
            consumer: self.consumer.clone(),
        }
    }

    fn pause_assignment(&self) {
        match self.consumer.assignment() {
            Ok(assignment) if assignment.count() > 0 => {
                if let Err(e) = self.consumer.pause(&assignment) {
                    warn!("failed to pause coordinator fetches: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("failed to read the current assignment: {}", e),
        }
    }

    /// Polls the group so rebalance callbacks fire, until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.consumer.recv() => match received {
                    // Records are read by the partition readers, never here
                    Ok(_) => self.pause_assignment(),
                    Err(e) => {
                        warn!("consumer group error: {}", e);
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                },
            }
        }

        info!("leaving the consumer group");
        self.consumer.unsubscribe();
    }
}

/// Forwards progress to the group's committed offsets for lag monitoring.
/// Never read back: workers resume from the offset ledger.
#[derive(Clone)]
pub struct GroupProgress {
    consumer: Arc<StreamConsumer<AssignmentContext>>,
}

impl ProgressHint for GroupProgress {
    fn record(&self, partition: &Partition, next_offset: i64) {
        let mut offsets = TopicPartitionList::new();
        if let Err(e) = offsets.add_partition_offset(
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(next_offset),
        ) {
            debug!(partition = %partition, "invalid progress hint: {}", e);
            return;
        }
        if let Err(e) = self.consumer.commit(&offsets, CommitMode::Async) {
            debug!(partition = %partition, "failed to send progress hint: {}", e);
        }
    }
}
