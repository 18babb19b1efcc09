mod test_support;

use std::sync::Arc;

use chrono::Utc;
use lead_intake_module::dedupe::DeliveryDedupeRecord;
use lead_intake_module::store::{DeliveryDedupeStore, PostgresStore, StoreError, TenantStore};
use lead_intake_module::tenant::{ForwardingVerification, Tenant};
use lead_intake_module::{process_inbound_email, InboundPayload, PipelineDeps, PipelineOutcome, PipelineSettings};
use test_support::{require_lead_test_db_url, RecordingNotifier};
use uuid::Uuid;

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

#[test]
fn postgres_store_dedupes_deliveries_and_leads() {
    let Some(db_url) = require_lead_test_db_url("postgres_store_dedupes_deliveries_and_leads") else {
        return;
    };
    let store = Arc::new(PostgresStore::new_from_url(&db_url).expect("postgres store"));

    let tenant_id = unique("tenant");
    let address = format!("{}@inbound.example", unique("acme"));
    store
        .upsert_tenant(
            &Tenant::new(tenant_id.clone(), "Acme", &address).with_notify_phones(["+61400000001"]),
        )
        .expect("seed tenant");

    let key = unique("delivery");
    let record = DeliveryDedupeRecord {
        signature_key: key.clone(),
        received_at: Utc::now(),
    };
    store.insert_delivery(&record).expect("first delivery");
    assert!(matches!(
        store.insert_delivery(&record),
        Err(StoreError::UniqueViolation(_))
    ));
    store.release_delivery(&key).expect("release");

    let notifier = Arc::new(RecordingNotifier::default());
    let deps = PipelineDeps::from_store(store.clone(), notifier.clone());
    let message_id = unique("msg");
    let payload = InboundPayload::from_fields([
        ("subject", "Quote request"),
        ("body-plain", "Call me at 0412 345 678"),
        ("From", "Jane <jane@example.com>"),
        ("recipient", address.as_str()),
        ("message-id", message_id.as_str()),
    ]);

    let first = process_inbound_email(&deps, PipelineSettings::default(), &payload).expect("first");
    assert!(matches!(first, PipelineOutcome::LeadCreated { notified: 1, .. }));
    let second = process_inbound_email(&deps, PipelineSettings::default(), &payload).expect("second");
    assert_eq!(second, PipelineOutcome::DuplicateLead);

    assert_eq!(store.count_leads(&tenant_id).expect("count"), 1);
    let lead = store
        .find_lead_by_message_id(&message_id)
        .expect("lookup")
        .expect("lead");
    assert_eq!(lead.phone, "0412345678");

    store
        .record_forwarding_verification(&tenant_id, "654321", ForwardingVerification::CodeVerified)
        .expect("verification");
    let tenant = store.get_tenant(&tenant_id).expect("get").expect("tenant");
    assert!(tenant.forwarding_confirmed);
    assert!(tenant.forwarding_verified());
    assert_eq!(notifier.sent().len(), 1);
}
