use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::normalize::{
    discount_percentage, extract_brand, parse_price, ProductCategory, RawPrice,
};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("malformed event payload: {0}")]
    Malformed(String),
    #[error("required field {0} is missing or empty")]
    MissingField(&'static str),
    #[error("field {field} has an unparseable price: {value}")]
    InvalidPrice { field: &'static str, value: String },
    #[error("field {0} must not be negative")]
    NegativePrice(&'static str),
    #[error("event type is not supported by this consumer")]
    UnsupportedEventType,
    #[error("record source {found} does not match the publishing source {expected}")]
    SourceMismatch { expected: String, found: String },
}

impl ValidationError {
    /// Stable label used in dead-letter records and metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            ValidationError::Malformed(_) => "malformed_payload",
            ValidationError::MissingField(_) => "missing_field",
            ValidationError::InvalidPrice { .. } => "invalid_price",
            ValidationError::NegativePrice(_) => "negative_price",
            ValidationError::UnsupportedEventType => "unsupported_event_type",
            ValidationError::SourceMismatch { .. } => "source_mismatch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Updated,
    /// Any tag this consumer does not know how to apply.
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    InStock,
    OutOfStock,
    #[default]
    #[serde(other)]
    Unknown,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::InStock => "in_stock",
            Availability::OutOfStock => "out_of_stock",
            Availability::Unknown => "unknown",
        }
    }
}

/// Normalized product attributes carried by every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductPayload {
    pub external_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ProductCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_price: Option<Decimal>,
    pub sale_price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount_percentage: Option<Decimal>,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub product_url: String,
    #[serde(default)]
    pub availability_status: Availability,
}

/// The unit of transport on the product events topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub source: String,
    /// Producer-side epoch milliseconds, for latency only. Ordering comes from the log.
    pub occurred_at: i64,
    pub payload: ProductPayload,
    pub fingerprint: String,
}

impl ProductEvent {
    pub fn new(record: NormalizedRecord, event_id: Uuid, occurred_at: i64) -> Self {
        Self {
            event_id,
            event_type: EventType::Updated,
            source: record.source,
            occurred_at,
            payload: record.payload,
            fingerprint: record.fingerprint,
        }
    }

    /// Partition key: every event of a source lands on the same partition.
    pub fn key(&self) -> &str {
        &self.source
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode and validate an event read from the log.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ValidationError> {
        let event: ProductEvent = serde_json::from_slice(bytes)
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.event_type == EventType::Unsupported {
            return Err(ValidationError::UnsupportedEventType);
        }
        if self.source.trim().is_empty() {
            return Err(ValidationError::MissingField("source"));
        }
        validate_payload(&self.payload)
    }
}

fn validate_payload(payload: &ProductPayload) -> Result<(), ValidationError> {
    if payload.external_id.trim().is_empty() {
        return Err(ValidationError::MissingField("external_id"));
    }
    if payload.title.trim().is_empty() {
        return Err(ValidationError::MissingField("title"));
    }
    check_price_signs(payload.sale_price, payload.original_price)
}

fn check_price_signs(
    sale_price: Decimal,
    original_price: Option<Decimal>,
) -> Result<(), ValidationError> {
    if sale_price.is_sign_negative() && !sale_price.is_zero() {
        return Err(ValidationError::NegativePrice("sale_price"));
    }
    if original_price.is_some_and(|price| price.is_sign_negative() && !price.is_zero()) {
        return Err(ValidationError::NegativePrice("original_price"));
    }
    Ok(())
}

/// Deterministic content hash over the fields that identify a listing at a price point.
pub fn fingerprint(source: &str, external_id: &str, title: &str, sale_price: Decimal) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(b":");
    hasher.update(external_id.as_bytes());
    hasher.update(b":");
    hasher.update(title.as_bytes());
    hasher.update(b":");
    hasher.update(sale_price.normalize().to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// A scraped listing as handed over by a scraper, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRecord {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(alias = "source_product_id")]
    pub external_id: String,
    pub title: String,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub original_price: Option<RawPrice>,
    pub sale_price: RawPrice,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub product_url: String,
    #[serde(default)]
    pub availability: Option<Availability>,
}

/// A candidate record that passed normalization, ready to become an event.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub source: String,
    pub payload: ProductPayload,
    pub fingerprint: String,
}

impl CandidateRecord {
    pub fn normalize(self, source: &str) -> Result<NormalizedRecord, ValidationError> {
        if source.trim().is_empty() {
            return Err(ValidationError::MissingField("source"));
        }
        // A blank source means the scraper did not set one
        let found = self.source.as_deref().map(str::trim).filter(|s| !s.is_empty());
        if let Some(found) = found {
            if found != source {
                return Err(ValidationError::SourceMismatch {
                    expected: source.to_owned(),
                    found: found.to_owned(),
                });
            }
        }

        let title = self.title.trim().to_owned();
        let sale_price =
            parse_price(&self.sale_price).ok_or_else(|| ValidationError::InvalidPrice {
                field: "sale_price",
                value: format!("{:?}", self.sale_price),
            })?;
        let original_price = match &self.original_price {
            None => None,
            Some(raw) => Some(parse_price(raw).ok_or_else(|| ValidationError::InvalidPrice {
                field: "original_price",
                value: format!("{:?}", raw),
            })?),
        };
        check_price_signs(sale_price, original_price)?;
        let brand = self
            .brand
            .filter(|b| !b.trim().is_empty())
            .or_else(|| extract_brand(&title).map(str::to_owned));

        let payload = ProductPayload {
            external_id: self.external_id.trim().to_owned(),
            brand,
            category: self.category.as_deref().map(ProductCategory::from_label),
            discount_percentage: discount_percentage(original_price, sale_price),
            original_price,
            sale_price,
            currency: self
                .currency
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| "USD".to_owned()),
            image_url: self.image_url,
            product_url: self.product_url,
            availability_status: self.availability.unwrap_or_default(),
            title,
        };
        validate_payload(&payload)?;

        Ok(NormalizedRecord {
            source: source.to_owned(),
            fingerprint: fingerprint(source, &payload.external_id, &payload.title, sale_price),
            payload,
        })
    }
}
