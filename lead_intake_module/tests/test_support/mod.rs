#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use lead_intake_module::notifier::{Notifier, NotifyError};
use lead_intake_module::store::SqliteStore;
use lead_intake_module::tenant::Tenant;
use lead_intake_module::{InboundPayload, PipelineDeps};
use tempfile::TempDir;

pub const ACME_ADDRESS: &str = "acme@inbound.example";
pub const ACME_PHONE: &str = "+61400000001";

pub fn require_lead_test_db_url(test_name: &str) -> Option<String> {
    dotenvy::dotenv().ok();
    match std::env::var("LEAD_TEST_DATABASE_URL") {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => {
            eprintln!("Skipping {test_name}; LEAD_TEST_DATABASE_URL not set.");
            None
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn send(&self, to: &str, body: &str) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), body.to_string()));
        Ok(())
    }
}

pub struct SqliteFixture {
    pub _dir: TempDir,
    pub store: Arc<SqliteStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub deps: PipelineDeps,
}

pub fn sqlite_fixture() -> SqliteFixture {
    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(SqliteStore::new(dir.path().join("leads.db")).expect("sqlite store"));
    store
        .upsert_tenant(&acme_tenant())
        .expect("seed tenant");
    let notifier = Arc::new(RecordingNotifier::default());
    let deps = PipelineDeps::from_store(store.clone(), notifier.clone());
    SqliteFixture {
        _dir: dir,
        store,
        notifier,
        deps,
    }
}

pub fn acme_tenant() -> Tenant {
    Tenant::new("tenant-acme", "Acme Plumbing", ACME_ADDRESS).with_notify_phones([ACME_PHONE])
}

pub fn quote_request_fields() -> Vec<(&'static str, &'static str)> {
    vec![
        ("subject", "Quote request"),
        ("body-plain", "Call me at 0412 345 678"),
        ("From", "Jane <jane@example.com>"),
        ("recipient", ACME_ADDRESS),
        ("message-id", "abc-1"),
    ]
}

/// Builds a payload from `overrides` layered over `base`; earlier keys win.
pub fn payload(
    overrides: &[(&'static str, &'static str)],
    base: &[(&'static str, &'static str)],
) -> InboundPayload {
    InboundPayload::from_fields(overrides.iter().chain(base.iter()).copied())
}
