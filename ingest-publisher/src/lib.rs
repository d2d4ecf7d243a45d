pub mod config;
pub mod fingerprint;
pub mod input;
pub mod publisher;
