use std::env;
use std::time::Duration;

use chrono::{DateTime, Utc};
use postgres::error::SqlState;
use postgres_native_tls::MakeTlsConnector;
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use tracing::error;

use super::{
    DeliveryDedupeStore, InboundEvent, InboundEventLog, LeadStore, StoreError, TenantStore,
};
use crate::dedupe::DeliveryDedupeRecord;
use crate::lead::NewLead;
use crate::tenant::{join_phones, split_phones, ForwardingVerification, Tenant};

type PgManager = PostgresConnectionManager<MakeTlsConnector>;

#[derive(Debug)]
struct LoggingErrorHandler;

impl r2d2::HandleError<postgres::Error> for LoggingErrorHandler {
    fn handle_error(&self, err: postgres::Error) {
        error!("lead store connection pool error: {:?}", err);
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tenants (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    inbound_address TEXT NOT NULL UNIQUE,
    forwarding_confirmed BOOLEAN NOT NULL DEFAULT FALSE,
    forwarding_confirmed_at TIMESTAMPTZ,
    forwarding_verification TEXT NOT NULL DEFAULT 'unset',
    forwarding_verification_code TEXT,
    notify_phones TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS leads (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    name TEXT NOT NULL,
    email TEXT NOT NULL,
    phone TEXT NOT NULL,
    description TEXT NOT NULL,
    source TEXT NOT NULL,
    status TEXT NOT NULL,
    message_id TEXT NOT NULL UNIQUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS leads_tenant_idx ON leads (tenant_id, created_at);
CREATE TABLE IF NOT EXISTS delivery_dedupe (
    signature_key TEXT PRIMARY KEY,
    received_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS inbound_events (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    message_id TEXT NOT NULL,
    outcome TEXT NOT NULL,
    detail TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
";

const TENANT_COLUMNS: &str = "id, name, inbound_address, forwarding_confirmed, forwarding_confirmed_at,
     forwarding_verification, forwarding_verification_code, notify_phones";

/// Pooled Postgres backend. The schema is ensured when the pool is built.
#[derive(Clone)]
pub struct PostgresStore {
    pool: Option<Pool<PgManager>>,
}

impl PostgresStore {
    /// Reads `LEAD_DATABASE_URL`, falling back to `DATABASE_URL`.
    pub fn from_env() -> Result<Self, StoreError> {
        let db_url = resolve_db_url()?;
        Self::new_from_url(&db_url)
    }

    pub fn new_from_url(db_url: &str) -> Result<Self, StoreError> {
        let config: postgres::Config = db_url.parse()?;
        let mut tls_builder = native_tls::TlsConnector::builder();
        if resolve_bool_env("LEAD_DATABASE_TLS_ALLOW_INVALID_CERTS") {
            tls_builder.danger_accept_invalid_certs(true);
            tls_builder.danger_accept_invalid_hostnames(true);
        }
        let tls_connector = tls_builder
            .build()
            .map_err(|err| StoreError::Config(err.to_string()))?;
        let manager = PostgresConnectionManager::new(config, MakeTlsConnector::new(tls_connector));
        let pool = Pool::builder()
            .max_size(8)
            .idle_timeout(Some(Duration::from_secs(300)))
            .error_handler(Box::new(LoggingErrorHandler))
            .build(manager)?;
        let store = Self { pool: Some(pool) };
        store.ensure_schema()?;
        Ok(store)
    }

    fn connection(&self) -> Result<PooledConnection<PgManager>, StoreError> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| StoreError::Config("lead store pool unavailable".to_string()))?;
        Ok(pool.get()?)
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        conn.batch_execute(SCHEMA)?;
        Ok(())
    }

    pub fn upsert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        conn.execute(
            "INSERT INTO tenants (id, name, inbound_address, forwarding_confirmed, forwarding_confirmed_at,
                                  forwarding_verification, forwarding_verification_code, notify_phones)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                inbound_address = EXCLUDED.inbound_address,
                forwarding_confirmed = EXCLUDED.forwarding_confirmed,
                forwarding_confirmed_at = EXCLUDED.forwarding_confirmed_at,
                forwarding_verification = EXCLUDED.forwarding_verification,
                forwarding_verification_code = EXCLUDED.forwarding_verification_code,
                notify_phones = EXCLUDED.notify_phones",
            &[
                &tenant.id,
                &tenant.name,
                &tenant.inbound_address,
                &tenant.forwarding_confirmed,
                &tenant.forwarding_confirmed_at,
                &tenant.verification.as_str(),
                &tenant.verification_code,
                &join_phones(&tenant.notify_phones),
            ],
        )
        .map_err(map_postgres_error)?;
        Ok(())
    }

    pub fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>, StoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            &format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = $1"),
            &[&tenant_id],
        )?;
        row.as_ref().map(tenant_from_row).transpose()
    }

    pub fn find_lead_by_message_id(&self, message_id: &str) -> Result<Option<NewLead>, StoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            "SELECT id, tenant_id, name, email, phone, description, source, status, message_id, created_at
             FROM leads
             WHERE message_id = $1",
            &[&message_id],
        )?;
        Ok(row.map(|row| NewLead {
            id: row.get(0),
            tenant_id: row.get(1),
            name: row.get(2),
            email: row.get(3),
            phone: row.get(4),
            description: row.get(5),
            source: row.get(6),
            status: row.get(7),
            message_id: row.get(8),
            created_at: row.get(9),
        }))
    }

    pub fn count_leads(&self, tenant_id: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection()?;
        let count: i64 = conn
            .query_one("SELECT COUNT(*) FROM leads WHERE tenant_id = $1", &[&tenant_id])?
            .get(0);
        Ok(count as u64)
    }
}

impl Drop for PostgresStore {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            std::thread::spawn(move || drop(pool));
        }
    }
}

impl TenantStore for PostgresStore {
    fn find_by_inbound_address(&self, address: &str) -> Result<Option<Tenant>, StoreError> {
        let mut conn = self.connection()?;
        let row = conn.query_opt(
            &format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE inbound_address = $1"),
            &[&address],
        )?;
        row.as_ref().map(tenant_from_row).transpose()
    }

    fn mark_forwarding_confirmed(
        &self,
        tenant_id: &str,
        confirmed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        conn.execute(
            "UPDATE tenants
             SET forwarding_confirmed = TRUE,
                 forwarding_confirmed_at = COALESCE(forwarding_confirmed_at, $2)
             WHERE id = $1",
            &[&tenant_id, &confirmed_at],
        )?;
        Ok(())
    }

    fn record_forwarding_verification(
        &self,
        tenant_id: &str,
        value: &str,
        state: ForwardingVerification,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        conn.execute(
            "UPDATE tenants
             SET forwarding_verification = $2,
                 forwarding_verification_code = $3
             WHERE id = $1",
            &[&tenant_id, &state.as_str(), &value],
        )?;
        Ok(())
    }
}

impl LeadStore for PostgresStore {
    fn insert_lead_if_absent(&self, lead: &NewLead) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let row = conn.execute(
            "INSERT INTO leads (id, tenant_id, name, email, phone, description, source, status, message_id, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (message_id) DO NOTHING",
            &[
                &lead.id,
                &lead.tenant_id,
                &lead.name,
                &lead.email,
                &lead.phone,
                &lead.description,
                &lead.source,
                &lead.status,
                &lead.message_id,
                &lead.created_at,
            ],
        )?;
        Ok(row > 0)
    }
}

impl DeliveryDedupeStore for PostgresStore {
    fn insert_delivery(&self, record: &DeliveryDedupeRecord) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        conn.execute(
            "INSERT INTO delivery_dedupe (signature_key, received_at) VALUES ($1, $2)",
            &[&record.signature_key, &record.received_at],
        )
        .map_err(map_postgres_error)?;
        Ok(())
    }

    fn release_delivery(&self, signature_key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        conn.execute(
            "DELETE FROM delivery_dedupe WHERE signature_key = $1",
            &[&signature_key],
        )?;
        Ok(())
    }
}

impl InboundEventLog for PostgresStore {
    fn record_event(&self, event: &InboundEvent) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        conn.execute(
            "INSERT INTO inbound_events (id, tenant_id, message_id, outcome, detail, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
            &[
                &event.id,
                &event.tenant_id,
                &event.message_id,
                &event.outcome,
                &event.detail,
                &event.created_at,
            ],
        )?;
        Ok(())
    }
}

fn tenant_from_row(row: &postgres::Row) -> Result<Tenant, StoreError> {
    let verification: String = row.get(5);
    let notify_phones: String = row.get(7);
    Ok(Tenant {
        id: row.get(0),
        name: row.get(1),
        inbound_address: row.get(2),
        forwarding_confirmed: row.get(3),
        forwarding_confirmed_at: row.get(4),
        verification: verification
            .parse::<ForwardingVerification>()
            .map_err(StoreError::InvalidValue)?,
        verification_code: row.get(6),
        notify_phones: split_phones(&notify_phones),
    })
}

fn map_postgres_error(err: postgres::Error) -> StoreError {
    if err.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        let detail = err
            .as_db_error()
            .and_then(|db| db.constraint().map(str::to_string))
            .unwrap_or_else(|| err.to_string());
        return StoreError::UniqueViolation(detail);
    }
    StoreError::Postgres(err)
}

fn resolve_db_url() -> Result<String, StoreError> {
    ["LEAD_DATABASE_URL", "DATABASE_URL"]
        .iter()
        .filter_map(|key| env::var(key).ok())
        .find(|value| !value.trim().is_empty())
        .ok_or_else(|| StoreError::Config("missing LEAD_DATABASE_URL/DATABASE_URL".to_string()))
}

fn resolve_bool_env(key: &str) -> bool {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_ascii_lowercase())
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
