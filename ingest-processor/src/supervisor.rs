use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use health::HealthRegistry;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ingest_common::ledger::OffsetLedger;
use ingest_common::log::{Partition, ReaderFactory};
use ingest_common::metrics_consts::REBALANCE_EVENTS_COUNTER;

use crate::error::WorkerError;
use crate::processor::IdempotentProcessor;
use crate::worker::{PartitionWorker, WorkerSettings};

/// Ownership changes decided by the consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentEvent {
    Assigned(Vec<Partition>),
    Revoked(Vec<Partition>),
}

/// Cancellation tokens of running workers, shared with the rebalance callback
/// so a revoked worker is fenced before the callback returns.
#[derive(Clone, Default)]
pub struct WorkerTokens {
    tokens: Arc<DashMap<Partition, CancellationToken>>,
}

impl WorkerTokens {
    pub fn cancel(&self, partition: &Partition) {
        if let Some((_, token)) = self.tokens.remove(partition) {
            token.cancel();
        }
    }

    pub fn is_running(&self, partition: &Partition) -> bool {
        self.tokens.contains_key(partition)
    }

    fn insert(&self, partition: Partition, token: CancellationToken) {
        if let Some(previous) = self.tokens.insert(partition, token) {
            previous.cancel();
        }
    }
}

struct RunningWorker {
    cancel: CancellationToken,
    handle: JoinHandle<Result<Option<i64>, WorkerError>>,
}

/// Runs one `PartitionWorker` task per owned partition.
pub struct PartitionSupervisor {
    readers: Arc<dyn ReaderFactory>,
    processor: Arc<IdempotentProcessor>,
    ledger: Arc<dyn OffsetLedger>,
    settings: WorkerSettings,
    tokens: WorkerTokens,
    liveness: Option<HealthRegistry>,
    restart_interval: Duration,
    workers: HashMap<Partition, RunningWorker>,
    // Owned partitions without a running worker, retried every restart interval
    stopped: HashSet<Partition>,
}

impl PartitionSupervisor {
    pub fn new(
        readers: Arc<dyn ReaderFactory>,
        processor: Arc<IdempotentProcessor>,
        ledger: Arc<dyn OffsetLedger>,
        settings: WorkerSettings,
        tokens: WorkerTokens,
    ) -> Self {
        Self {
            readers,
            processor,
            ledger,
            settings,
            tokens,
            liveness: None,
            restart_interval: Duration::from_secs(5),
            workers: HashMap::new(),
            stopped: HashSet::new(),
        }
    }

    pub fn with_liveness(mut self, liveness: HealthRegistry) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn with_restart_interval(mut self, interval: Duration) -> Self {
        self.restart_interval = interval;
        self
    }

    /// Partitions with a running worker, sorted.
    pub fn running(&self) -> Vec<Partition> {
        let mut partitions: Vec<Partition> = self.workers.keys().cloned().collect();
        partitions.sort();
        partitions
    }

    fn component(partition: &Partition) -> String {
        format!("worker:{partition}")
    }

    async fn spawn(&mut self, partition: Partition) {
        if self.workers.contains_key(&partition) {
            return;
        }
        let reader = match self.readers.open(&partition) {
            Ok(reader) => reader,
            Err(e) => {
                error!(partition = %partition, error = %e, "failed to open partition reader");
                self.stopped.insert(partition);
                return;
            }
        };

        let cancel = CancellationToken::new();
        let mut worker = PartitionWorker::new(
            reader,
            self.processor.clone(),
            self.ledger.clone(),
            self.settings,
            cancel.clone(),
        );
        if let Some(registry) = &self.liveness {
            let handle = registry
                .register(Self::component(&partition), time::Duration::seconds(60))
                .await;
            worker = worker.with_liveness(handle);
        }

        self.tokens.insert(partition.clone(), cancel.clone());
        self.stopped.remove(&partition);
        let handle = tokio::spawn(worker.run());
        self.workers
            .insert(partition, RunningWorker { cancel, handle });
    }

    pub async fn assign(&mut self, partitions: Vec<Partition>) {
        counter!(REBALANCE_EVENTS_COUNTER, "kind" => "assign").increment(1);
        info!(count = partitions.len(), "partitions assigned");
        for partition in partitions {
            self.spawn(partition).await;
        }
    }

    /// Cancel the workers and wait for their in-flight event to finish.
    pub async fn revoke(&mut self, partitions: &[Partition]) {
        counter!(REBALANCE_EVENTS_COUNTER, "kind" => "revoke").increment(1);
        info!(count = partitions.len(), "partitions revoked");
        for partition in partitions {
            self.tokens.cancel(partition);
            self.stopped.remove(partition);
            if let Some(worker) = self.workers.remove(partition) {
                worker.cancel.cancel();
                Self::join(partition, worker.handle).await;
            }
            if let Some(registry) = &self.liveness {
                registry.deregister(&Self::component(partition)).await;
            }
        }
    }

    async fn join(partition: &Partition, handle: JoinHandle<Result<Option<i64>, WorkerError>>) {
        match handle.await {
            Ok(Ok(_)) => {}
            // Already logged by the worker
            Ok(Err(_)) => {}
            Err(e) => error!(partition = %partition, error = %e, "partition worker panicked"),
        }
    }

    /// Collect workers that stopped on their own, e.g. on a ledger failure.
    /// Their partitions stay owned and are restarted by `restart_stopped`.
    pub async fn reap(&mut self) -> Vec<Partition> {
        let finished: Vec<Partition> = self
            .workers
            .iter()
            .filter(|(_, worker)| worker.handle.is_finished())
            .map(|(partition, _)| partition.clone())
            .collect();

        let mut crashed = Vec::with_capacity(finished.len());
        for partition in finished {
            // A missing token means the rebalance callback fenced it, the revoke follows
            let fenced = !self.tokens.is_running(&partition);
            if let Some(worker) = self.workers.remove(&partition) {
                self.tokens.cancel(&partition);
                Self::join(&partition, worker.handle).await;
            }
            if !fenced {
                warn!(partition = %partition, "partition worker stopped, will restart");
                self.stopped.insert(partition.clone());
                crashed.push(partition);
            }
        }
        crashed
    }

    /// Start a new worker for every owned partition that has none.
    /// Each one resumes from the ledger, so a ledger that is still down stops it again.
    pub async fn restart_stopped(&mut self) {
        let stopped: Vec<Partition> = self.stopped.drain().collect();
        for partition in stopped {
            self.spawn(partition).await;
        }
    }

    pub async fn shutdown(&mut self) {
        let partitions = self.running();
        self.revoke(&partitions).await;
        self.stopped.clear();
    }

    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<AssignmentEvent>,
        shutdown: CancellationToken,
    ) {
        let mut restart = tokio::time::interval(self.restart_interval);
        restart.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(AssignmentEvent::Assigned(partitions)) => self.assign(partitions).await,
                    Some(AssignmentEvent::Revoked(partitions)) => self.revoke(&partitions).await,
                    None => break,
                },
                _ = restart.tick() => {
                    self.reap().await;
                    self.restart_stopped().await;
                }
            }
        }

        info!("stopping partition workers");
        self.shutdown().await;
    }
}
