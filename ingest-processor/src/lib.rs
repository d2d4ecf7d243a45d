pub mod config;
pub mod consumer;
pub mod error;
pub mod idempotency;
pub mod processor;
pub mod supervisor;
pub mod worker;
