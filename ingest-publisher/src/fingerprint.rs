use std::sync::Arc;

use metrics::counter;
use tracing::warn;

use ingest_common::cache::Client;
use ingest_common::metrics_consts::FINGERPRINT_STORE_ERRORS_COUNTER;

pub const DEFAULT_FINGERPRINT_TTL_SECS: u64 = 7 * 24 * 3600;

/// Producer-side membership set of recently published fingerprints.
///
/// Only a load shedder: every cache failure reads as "not seen", so the worst
/// case is a duplicate event that the processor absorbs.
pub struct FingerprintStore {
    client: Arc<dyn Client>,
    ttl_secs: u64,
}

impl FingerprintStore {
    pub fn new(client: Arc<dyn Client>, ttl_secs: u64) -> Self {
        Self { client, ttl_secs }
    }

    pub fn key(fingerprint: &str) -> String {
        format!("ingest:fingerprint:{fingerprint}")
    }

    pub async fn seen(&self, fingerprint: &str) -> bool {
        match self.client.exists(Self::key(fingerprint)).await {
            Ok(seen) => seen,
            Err(e) => {
                warn!(error = %e, "fingerprint lookup failed, treating as unseen");
                counter!(FINGERPRINT_STORE_ERRORS_COUNTER, "op" => "exists").increment(1);
                false
            }
        }
    }

    pub async fn remember(&self, fingerprint: &str) {
        if let Err(e) = self
            .client
            .set_ex(Self::key(fingerprint), self.ttl_secs)
            .await
        {
            warn!(error = %e, "failed to record fingerprint");
            counter!(FINGERPRINT_STORE_ERRORS_COUNTER, "op" => "set").increment(1);
        }
    }
}
