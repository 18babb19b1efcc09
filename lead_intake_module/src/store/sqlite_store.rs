//! Single-file SQLite backend used for local runs and tests.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{ffi, params, Connection, ErrorCode, OptionalExtension};

use super::{
    format_datetime, parse_datetime, DeliveryDedupeStore, InboundEvent, InboundEventLog,
    LeadStore, StoreError, TenantStore,
};
use crate::dedupe::DeliveryDedupeRecord;
use crate::lead::NewLead;
use crate::tenant::{join_phones, split_phones, ForwardingVerification, Tenant};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tenants (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    inbound_address TEXT NOT NULL UNIQUE,
    forwarding_confirmed INTEGER NOT NULL DEFAULT 0,
    forwarding_confirmed_at TEXT,
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
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS leads_tenant_idx ON leads (tenant_id, created_at);
CREATE TABLE IF NOT EXISTS delivery_dedupe (
    signature_key TEXT PRIMARY KEY,
    received_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS inbound_events (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    message_id TEXT NOT NULL,
    outcome TEXT NOT NULL,
    detail TEXT,
    created_at TEXT NOT NULL
);
";

const TENANT_COLUMNS: &str = "id, name, inbound_address, forwarding_confirmed, forwarding_confirmed_at,
     forwarding_verification, forwarding_verification_code, notify_phones";

#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    /// Opens (and if needed creates) the database at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self { path: path.into() };
        let _ = store.open()?;
        Ok(store)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Inserts or replaces a tenant row. Used for provisioning and tests.
    pub fn upsert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO tenants (id, name, inbound_address, forwarding_confirmed, forwarding_confirmed_at,
                                  forwarding_verification, forwarding_verification_code, notify_phones)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                inbound_address = excluded.inbound_address,
                forwarding_confirmed = excluded.forwarding_confirmed,
                forwarding_confirmed_at = excluded.forwarding_confirmed_at,
                forwarding_verification = excluded.forwarding_verification,
                forwarding_verification_code = excluded.forwarding_verification_code,
                notify_phones = excluded.notify_phones",
            params![
                tenant.id,
                tenant.name,
                tenant.inbound_address,
                tenant.forwarding_confirmed as i64,
                tenant.forwarding_confirmed_at.map(format_datetime),
                tenant.verification.as_str(),
                tenant.verification_code,
                join_phones(&tenant.notify_phones),
            ],
        )
        .map_err(map_sqlite_error)?;
        Ok(())
    }

    pub fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>, StoreError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = ?1"),
                params![tenant_id],
                tenant_row,
            )
            .optional()?;
        row.map(TenantRow::into_tenant).transpose()
    }

    pub fn find_lead_by_message_id(&self, message_id: &str) -> Result<Option<NewLead>, StoreError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT id, tenant_id, name, email, phone, description, source, status, message_id, created_at
                 FROM leads
                 WHERE message_id = ?1",
                params![message_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, String>(9)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((id, tenant_id, name, email, phone, description, source, status, message_id, created_at)) => {
                Ok(Some(NewLead {
                    id,
                    tenant_id,
                    name,
                    email,
                    phone,
                    description,
                    source,
                    status,
                    message_id,
                    created_at: parse_datetime(&created_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn count_leads(&self, tenant_id: &str) -> Result<u64, StoreError> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM leads WHERE tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn count_deliveries(&self) -> Result<u64, StoreError> {
        let conn = self.open()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM delivery_dedupe", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Outcomes recorded for `message_id`, oldest first.
    pub fn event_outcomes(&self, message_id: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT outcome FROM inbound_events
             WHERE message_id = ?1
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![message_id], |row| row.get::<_, String>(0))?;
        let mut outcomes = Vec::new();
        for row in rows {
            outcomes.push(row?);
        }
        Ok(outcomes)
    }

    fn open(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }
}

impl TenantStore for SqliteStore {
    fn find_by_inbound_address(&self, address: &str) -> Result<Option<Tenant>, StoreError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE inbound_address = ?1"),
                params![address],
                tenant_row,
            )
            .optional()?;
        row.map(TenantRow::into_tenant).transpose()
    }

    fn mark_forwarding_confirmed(
        &self,
        tenant_id: &str,
        confirmed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE tenants
             SET forwarding_confirmed = 1,
                 forwarding_confirmed_at = COALESCE(forwarding_confirmed_at, ?2)
             WHERE id = ?1",
            params![tenant_id, format_datetime(confirmed_at)],
        )?;
        Ok(())
    }

    fn record_forwarding_verification(
        &self,
        tenant_id: &str,
        value: &str,
        state: ForwardingVerification,
    ) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE tenants
             SET forwarding_verification = ?2,
                 forwarding_verification_code = ?3
             WHERE id = ?1",
            params![tenant_id, state.as_str(), value],
        )?;
        Ok(())
    }
}

impl LeadStore for SqliteStore {
    fn insert_lead_if_absent(&self, lead: &NewLead) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let inserted = conn.execute(
            "INSERT INTO leads (id, tenant_id, name, email, phone, description, source, status, message_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(message_id) DO NOTHING",
            params![
                lead.id,
                lead.tenant_id,
                lead.name,
                lead.email,
                lead.phone,
                lead.description,
                lead.source,
                lead.status,
                lead.message_id,
                format_datetime(lead.created_at),
            ],
        )?;
        Ok(inserted > 0)
    }
}

impl DeliveryDedupeStore for SqliteStore {
    fn insert_delivery(&self, record: &DeliveryDedupeRecord) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO delivery_dedupe (signature_key, received_at) VALUES (?1, ?2)",
            params![record.signature_key, format_datetime(record.received_at)],
        )
        .map_err(map_sqlite_error)?;
        Ok(())
    }

    fn release_delivery(&self, signature_key: &str) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "DELETE FROM delivery_dedupe WHERE signature_key = ?1",
            params![signature_key],
        )?;
        Ok(())
    }
}

impl InboundEventLog for SqliteStore {
    fn record_event(&self, event: &InboundEvent) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO inbound_events (id, tenant_id, message_id, outcome, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id,
                event.tenant_id,
                event.message_id,
                event.outcome,
                event.detail,
                format_datetime(event.created_at),
            ],
        )?;
        Ok(())
    }
}

struct TenantRow {
    id: String,
    name: String,
    inbound_address: String,
    forwarding_confirmed: i64,
    forwarding_confirmed_at: Option<String>,
    verification: String,
    verification_code: Option<String>,
    notify_phones: String,
}

impl TenantRow {
    fn into_tenant(self) -> Result<Tenant, StoreError> {
        let forwarding_confirmed_at = self
            .forwarding_confirmed_at
            .as_deref()
            .map(parse_datetime)
            .transpose()?;
        let verification = self
            .verification
            .parse::<ForwardingVerification>()
            .map_err(StoreError::InvalidValue)?;
        Ok(Tenant {
            id: self.id,
            name: self.name,
            inbound_address: self.inbound_address,
            forwarding_confirmed: self.forwarding_confirmed != 0,
            forwarding_confirmed_at,
            verification,
            verification_code: self.verification_code,
            notify_phones: split_phones(&self.notify_phones),
        })
    }
}

fn tenant_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TenantRow> {
    Ok(TenantRow {
        id: row.get(0)?,
        name: row.get(1)?,
        inbound_address: row.get(2)?,
        forwarding_confirmed: row.get(3)?,
        forwarding_confirmed_at: row.get(4)?,
        verification: row.get(5)?,
        verification_code: row.get(6)?,
        notify_phones: row.get(7)?,
    })
}

fn map_sqlite_error(err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(code, message) = &err {
        let duplicate = matches!(
            code.extended_code,
            ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        );
        if code.code == ErrorCode::ConstraintViolation && duplicate {
            let detail = message.clone().unwrap_or_else(|| code.to_string());
            return StoreError::UniqueViolation(detail);
        }
    }
    StoreError::Sqlite(err)
}
