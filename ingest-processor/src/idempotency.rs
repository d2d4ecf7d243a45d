use std::sync::Arc;

use metrics::counter;
use tracing::warn;
use uuid::Uuid;

use ingest_common::cache::Client;
use ingest_common::metrics_consts::IDEMPOTENCY_CACHE_ERRORS_COUNTER;

pub const DEFAULT_IDEMPOTENCY_TTL_SECS: u64 = 24 * 3600;

/// Fast path in front of the canonical store: event ids applied recently.
///
/// A cache error reads as "not processed". The store's `last_event_id` guard
/// still turns a redelivery of the latest event into a no-op.
pub struct IdempotencyCache {
    client: Arc<dyn Client>,
    ttl_secs: u64,
}

impl IdempotencyCache {
    pub fn new(client: Arc<dyn Client>, ttl_secs: u64) -> Self {
        Self { client, ttl_secs }
    }

    pub fn key(event_id: &Uuid) -> String {
        format!("ingest:processed:{event_id}")
    }

    pub async fn was_processed(&self, event_id: &Uuid) -> bool {
        match self.client.exists(Self::key(event_id)).await {
            Ok(processed) => processed,
            Err(e) => {
                warn!(%event_id, error = %e, "idempotency lookup failed, deferring to the store");
                counter!(IDEMPOTENCY_CACHE_ERRORS_COUNTER, "op" => "exists").increment(1);
                false
            }
        }
    }

    pub async fn mark_processed(&self, event_id: &Uuid) {
        if let Err(e) = self.client.set_ex(Self::key(event_id), self.ttl_secs).await {
            warn!(%event_id, error = %e, "failed to mark event as processed");
            counter!(IDEMPOTENCY_CACHE_ERRORS_COUNTER, "op" => "set").increment(1);
        }
    }
}
