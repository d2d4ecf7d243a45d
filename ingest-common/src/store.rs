use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use uuid::Uuid;

use crate::event::ProductEvent;
use crate::ledger::{record_offset, ConsumerOffset, MemoryOffsetLedger};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection to the canonical store failed: {0}")]
    ConnectionError(sqlx::Error),
    #[error("{command} query on the canonical store failed: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("canonical store is unavailable: {0}")]
    Unavailable(String),
    #[error("canonical store rejected the write: {0}")]
    Rejected(String),
}

impl StoreError {
    fn query(command: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
        move |error| StoreError::QueryError {
            command: command.to_owned(),
            error,
        }
    }

    /// Data-dependent failures (constraint and data exceptions) will fail the
    /// same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::ConnectionError(_) | StoreError::Unavailable(_) => true,
            StoreError::Rejected(_) => false,
            StoreError::QueryError { error, .. } => match error {
                // SQLSTATE classes 22 (data exception) and 23 (integrity violation)
                sqlx::Error::Database(db) => !db
                    .code()
                    .is_some_and(|code| code.starts_with("22") || code.starts_with("23")),
                sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => false,
                _ => true,
            },
        }
    }
}

/// The materialized product, unique on `(source, external_id)`.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct CanonicalProduct {
    pub source: String,
    pub external_id: String,
    pub title: String,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub original_price: Option<Decimal>,
    pub sale_price: Decimal,
    pub discount_percentage: Option<Decimal>,
    pub currency: String,
    pub image_url: Option<String>,
    pub product_url: String,
    pub availability: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_event_id: Uuid,
    pub last_offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceChangeKind {
    SaleStarted,
    SaleEnded,
    AvailabilityChanged,
}

impl PriceChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceChangeKind::SaleStarted => "sale_started",
            PriceChangeKind::SaleEnded => "sale_ended",
            PriceChangeKind::AvailabilityChanged => "availability_changed",
        }
    }
}

/// Append-only audit row, written when an update changes price or availability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceHistory {
    pub source: String,
    pub external_id: String,
    pub event_id: Uuid,
    pub original_price: Option<Decimal>,
    pub sale_price: Decimal,
    pub availability: String,
    pub change_kind: PriceChangeKind,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertChange {
    Inserted,
    Updated { history_appended: bool },
    /// The row was last written by this event or by a later offset, nothing to do.
    AlreadyApplied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub change: UpsertChange,
    /// The consumer offset was persisted in the same transaction as the upsert.
    pub offset_recorded: bool,
}

/// Single-writer canonical store. `apply` is one all-or-nothing unit of work per event.
#[async_trait]
pub trait CanonicalStore: Send + Sync {
    async fn apply(
        &self,
        event: &ProductEvent,
        offset: &ConsumerOffset,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome, StoreError>;
}

/// The row and history to write for an event, given the current row.
#[derive(Debug)]
enum UpsertPlan {
    Skip,
    Insert(CanonicalProduct),
    Update(CanonicalProduct, Option<PriceHistory>),
}

fn price_change(existing: &CanonicalProduct, updated: &CanonicalProduct) -> Option<PriceChangeKind> {
    let before = (existing.sale_price, existing.original_price);
    let after = (updated.sale_price, updated.original_price);
    if after < before {
        Some(PriceChangeKind::SaleStarted)
    } else if after > before {
        Some(PriceChangeKind::SaleEnded)
    } else if existing.availability != updated.availability {
        Some(PriceChangeKind::AvailabilityChanged)
    } else {
        None
    }
}

fn plan_upsert(
    existing: Option<&CanonicalProduct>,
    event: &ProductEvent,
    offset: i64,
    now: DateTime<Utc>,
) -> UpsertPlan {
    let payload = &event.payload;
    let row = CanonicalProduct {
        source: event.source.clone(),
        external_id: payload.external_id.clone(),
        title: payload.title.clone(),
        brand: payload.brand.clone(),
        category: payload.category.map(|c| c.as_str().to_owned()),
        original_price: payload.original_price,
        sale_price: payload.sale_price,
        discount_percentage: payload.discount_percentage,
        currency: payload.currency.clone(),
        image_url: payload.image_url.clone(),
        product_url: payload.product_url.clone(),
        availability: payload.availability_status.as_str().to_owned(),
        first_seen_at: existing.map(|e| e.first_seen_at).unwrap_or(now),
        last_seen_at: now,
        last_event_id: event.event_id,
        last_offset: offset,
    };

    match existing {
        None => UpsertPlan::Insert(row),
        // Offsets only move forward within a partition, and a listing's source
        // pins it to one partition, so anything at or below the row's offset is stale
        Some(existing)
            if existing.last_event_id == event.event_id || offset <= existing.last_offset =>
        {
            UpsertPlan::Skip
        }
        Some(existing) => {
            let history = price_change(existing, &row).map(|change_kind| PriceHistory {
                source: row.source.clone(),
                external_id: row.external_id.clone(),
                event_id: event.event_id,
                original_price: row.original_price,
                sale_price: row.sale_price,
                availability: row.availability.clone(),
                change_kind,
                recorded_at: now,
            });
            UpsertPlan::Update(row, history)
        }
    }
}

/// Canonical store in Postgres. Each event is one transaction covering the
/// upsert, the optional price history row and the consumer offset.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(StoreError::ConnectionError)?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn get(
        &self,
        source: &str,
        external_id: &str,
    ) -> Result<Option<CanonicalProduct>, StoreError> {
        sqlx::query_as::<_, CanonicalProduct>(
            r#"SELECT * FROM canonical_products WHERE source = $1 AND external_id = $2"#,
        )
        .bind(source)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::query("SELECT"))
    }
}

const SELECT_FOR_UPDATE: &str = r#"
SELECT
    source, external_id, title, brand, category, original_price, sale_price,
    discount_percentage, currency, image_url, product_url, availability,
    first_seen_at, last_seen_at, last_event_id, last_offset
FROM canonical_products
WHERE source = $1 AND external_id = $2
FOR UPDATE
"#;

const INSERT_PRODUCT: &str = r#"
INSERT INTO canonical_products (
    source, external_id, title, brand, category, original_price, sale_price,
    discount_percentage, currency, image_url, product_url, availability,
    first_seen_at, last_seen_at, last_event_id, last_offset
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
ON CONFLICT (source, external_id) DO NOTHING
"#;

const UPDATE_PRODUCT: &str = r#"
UPDATE canonical_products
SET
    title = $3, brand = $4, category = $5, original_price = $6, sale_price = $7,
    discount_percentage = $8, currency = $9, image_url = $10, product_url = $11,
    availability = $12, last_seen_at = $13, last_event_id = $14, last_offset = $15
WHERE source = $1 AND external_id = $2
"#;

const INSERT_HISTORY: &str = r#"
INSERT INTO price_history (
    source, external_id, event_id, original_price, sale_price, availability,
    change_kind, recorded_at
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
"#;

#[async_trait]
impl CanonicalStore for PgStore {
    async fn apply(
        &self,
        event: &ProductEvent,
        offset: &ConsumerOffset,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(StoreError::ConnectionError)?;

        let existing = sqlx::query_as::<_, CanonicalProduct>(SELECT_FOR_UPDATE)
            .bind(&event.source)
            .bind(&event.payload.external_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::query("SELECT"))?;

        let change = match plan_upsert(existing.as_ref(), event, offset.offset, now) {
            UpsertPlan::Skip => UpsertChange::AlreadyApplied,
            UpsertPlan::Insert(row) => {
                let inserted = sqlx::query(INSERT_PRODUCT)
                    .bind(&row.source)
                    .bind(&row.external_id)
                    .bind(&row.title)
                    .bind(&row.brand)
                    .bind(&row.category)
                    .bind(row.original_price)
                    .bind(row.sale_price)
                    .bind(row.discount_percentage)
                    .bind(&row.currency)
                    .bind(&row.image_url)
                    .bind(&row.product_url)
                    .bind(&row.availability)
                    .bind(row.first_seen_at)
                    .bind(row.last_seen_at)
                    .bind(row.last_event_id)
                    .bind(row.last_offset)
                    .execute(&mut *tx)
                    .await
                    .map_err(StoreError::query("INSERT"))?;
                if inserted.rows_affected() == 0 {
                    // Another writer inserted the row after our SELECT, retry sees it
                    return Err(StoreError::Unavailable(format!(
                        "concurrent insert of {}/{}",
                        row.source, row.external_id
                    )));
                }
                UpsertChange::Inserted
            }
            UpsertPlan::Update(row, history) => {
                sqlx::query(UPDATE_PRODUCT)
                    .bind(&row.source)
                    .bind(&row.external_id)
                    .bind(&row.title)
                    .bind(&row.brand)
                    .bind(&row.category)
                    .bind(row.original_price)
                    .bind(row.sale_price)
                    .bind(row.discount_percentage)
                    .bind(&row.currency)
                    .bind(&row.image_url)
                    .bind(&row.product_url)
                    .bind(&row.availability)
                    .bind(row.last_seen_at)
                    .bind(row.last_event_id)
                    .bind(row.last_offset)
                    .execute(&mut *tx)
                    .await
                    .map_err(StoreError::query("UPDATE"))?;

                let history_appended = history.is_some();
                if let Some(history) = history {
                    sqlx::query(INSERT_HISTORY)
                        .bind(&history.source)
                        .bind(&history.external_id)
                        .bind(history.event_id)
                        .bind(history.original_price)
                        .bind(history.sale_price)
                        .bind(&history.availability)
                        .bind(history.change_kind.as_str())
                        .bind(history.recorded_at)
                        .execute(&mut *tx)
                        .await
                        .map_err(StoreError::query("INSERT"))?;
                }
                UpsertChange::Updated { history_appended }
            }
        };

        record_offset(&mut *tx, offset)
            .await
            .map_err(StoreError::query("UPSERT"))?;

        tx.commit().await.map_err(StoreError::query("COMMIT"))?;

        Ok(ApplyOutcome {
            change,
            offset_recorded: true,
        })
    }
}

#[derive(Default)]
struct MemoryState {
    products: BTreeMap<(String, String), CanonicalProduct>,
    history: Vec<PriceHistory>,
    applies: usize,
}

struct InjectedFailure {
    remaining: u32,
    retryable: bool,
}

/// In-memory canonical store for tests.
///
/// Built `with_ledger`, it records offsets in the same critical section as the
/// upsert, like `PgStore`. Without one, offsets are left to the caller.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    ledger: Option<Arc<MemoryOffsetLedger>>,
    failures: Mutex<HashMap<String, InjectedFailure>>,
    apply_delay: Mutex<Option<Duration>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ledger(ledger: Arc<MemoryOffsetLedger>) -> Self {
        Self {
            ledger: Some(ledger),
            ..Default::default()
        }
    }

    /// The next `times` applies of this external id fail.
    pub fn fail_next(&self, external_id: &str, times: u32, retryable: bool) {
        lock(&self.failures).insert(
            external_id.to_owned(),
            InjectedFailure {
                remaining: times,
                retryable,
            },
        );
    }

    pub fn set_apply_delay(&self, delay: Option<Duration>) {
        *lock(&self.apply_delay) = delay;
    }

    pub fn get(&self, source: &str, external_id: &str) -> Option<CanonicalProduct> {
        lock(&self.state)
            .products
            .get(&(source.to_owned(), external_id.to_owned()))
            .cloned()
    }

    /// All products ordered by `(source, external_id)`.
    pub fn products(&self) -> Vec<CanonicalProduct> {
        lock(&self.state).products.values().cloned().collect()
    }

    pub fn history(&self) -> Vec<PriceHistory> {
        lock(&self.state).history.clone()
    }

    /// Number of applies that changed the store.
    pub fn applies(&self) -> usize {
        lock(&self.state).applies
    }

    fn injected_failure(&self, external_id: &str) -> Option<StoreError> {
        let mut failures = lock(&self.failures);
        let failure = failures.get_mut(external_id)?;
        if failure.remaining == 0 {
            return None;
        }
        failure.remaining -= 1;
        Some(if failure.retryable {
            StoreError::Unavailable(format!("injected failure for {external_id}"))
        } else {
            StoreError::Rejected(format!("injected rejection of {external_id}"))
        })
    }
}

#[async_trait]
impl CanonicalStore for MemoryStore {
    async fn apply(
        &self,
        event: &ProductEvent,
        offset: &ConsumerOffset,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome, StoreError> {
        let delay = *lock(&self.apply_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.injected_failure(&event.payload.external_id) {
            return Err(err);
        }

        let mut state = lock(&self.state);
        let key = (event.source.clone(), event.payload.external_id.clone());
        let change = match plan_upsert(state.products.get(&key), event, offset.offset, now) {
            UpsertPlan::Skip => UpsertChange::AlreadyApplied,
            UpsertPlan::Insert(row) => {
                state.products.insert(key, row);
                state.applies += 1;
                UpsertChange::Inserted
            }
            UpsertPlan::Update(row, history) => {
                state.products.insert(key, row);
                state.applies += 1;
                let history_appended = history.is_some();
                state.history.extend(history);
                UpsertChange::Updated { history_appended }
            }
        };

        if let Some(ledger) = &self.ledger {
            ledger.record(offset);
        }

        Ok(ApplyOutcome {
            change,
            offset_recorded: self.ledger.is_some(),
        })
    }
}
