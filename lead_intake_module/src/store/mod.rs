//! Persistence seams for the intake pipeline.
//!
//! Every write that guards correctness relies on a uniqueness constraint in the
//! backing database rather than a read-then-write check, so concurrent webhook
//! deliveries race on the insert itself.

mod postgres_store;
mod sqlite_store;

use chrono::{DateTime, Utc};

use crate::dedupe::DeliveryDedupeRecord;
use crate::lead::NewLead;
use crate::tenant::{ForwardingVerification, Tenant};

pub use postgres_store::PostgresStore;
pub use sqlite_store::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("postgres error: {0}")]
    Postgres(#[from] postgres::Error),
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("store config error: {0}")]
    Config(String),
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
}

pub trait TenantStore: Send + Sync {
    fn find_by_inbound_address(&self, address: &str) -> Result<Option<Tenant>, StoreError>;

    /// Sets the confirmed flag; the timestamp is only written the first time.
    fn mark_forwarding_confirmed(
        &self,
        tenant_id: &str,
        confirmed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Stores a verification code or confirmation URL in the shared slot.
    fn record_forwarding_verification(
        &self,
        tenant_id: &str,
        value: &str,
        state: ForwardingVerification,
    ) -> Result<(), StoreError>;
}

pub trait LeadStore: Send + Sync {
    /// Returns `true` only when a new row was written for `lead.message_id`.
    fn insert_lead_if_absent(&self, lead: &NewLead) -> Result<bool, StoreError>;
}

pub trait DeliveryDedupeStore: Send + Sync {
    /// Plain insert; a repeated signature key fails with
    /// [`StoreError::UniqueViolation`].
    fn insert_delivery(&self, record: &DeliveryDedupeRecord) -> Result<(), StoreError>;

    fn release_delivery(&self, signature_key: &str) -> Result<(), StoreError>;
}

pub trait InboundEventLog: Send + Sync {
    fn record_event(&self, event: &InboundEvent) -> Result<(), StoreError>;
}

/// Audit row written once per terminal pipeline outcome.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub id: String,
    pub tenant_id: String,
    pub message_id: String,
    pub outcome: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub(crate) fn format_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

pub(crate) fn parse_datetime(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}
