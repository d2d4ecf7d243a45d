//! Shared building blocks of the product ingestion pipeline.
//!
//! The publisher and the processor binaries are thin wiring over these modules:
//! the event model and its fingerprint, the cache client behind both dedup
//! layers, the durable log interface and its Kafka adapter, the offset ledger,
//! the canonical store and the dead-letter router.
//!
//! Errors are logged with their display form (`error = %e`) at the point where
//! they are handled, not where they are propagated.

pub mod cache;
pub mod config;
pub mod dead_letter;
pub mod event;
pub mod ledger;
pub mod log;
pub mod metrics;
pub mod metrics_consts;
pub mod normalize;
pub mod retry;
pub mod store;
pub mod time;
