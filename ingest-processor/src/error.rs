use thiserror::Error;

use ingest_common::ledger::LedgerError;
use ingest_common::log::LogError;

/// Why a partition worker stopped. Event-level failures never surface here,
/// they end in the dead-letter topic.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("offset ledger failed, partition stopped: {0}")]
    Ledger(#[from] LedgerError),
    #[error("partition reader failed: {0}")]
    Log(#[from] LogError),
}
