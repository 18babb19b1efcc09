//! End-to-end processing of one inbound-email webhook.
//!
//! Stage order: canonicalize, resolve tenant, delivery dedupe, forwarding
//! handshake (including the first-contact side effect), classify, lead upsert,
//! notify. Every stage after dedupe may short-circuit with a terminal outcome.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info};
use uuid::Uuid;

use crate::canonical::{canonicalize, InboundMessage, InboundPayload};
use crate::classifier::{classify, BlockReason, Classification};
use crate::dedupe::check_delivery;
use crate::handshake::{run_handshake, HandshakeOutcome};
use crate::lead::{derive_lead, upsert_lead, LeadUpsert};
use crate::notifier::{notify_new_lead, Notifier};
use crate::store::{
    DeliveryDedupeStore, InboundEvent, InboundEventLog, LeadStore, StoreError, TenantStore,
};
use crate::tenant::{resolve_tenant, Tenant};

#[derive(Clone)]
pub struct PipelineDeps {
    pub tenants: Arc<dyn TenantStore>,
    pub leads: Arc<dyn LeadStore>,
    pub deliveries: Arc<dyn DeliveryDedupeStore>,
    pub events: Arc<dyn InboundEventLog>,
    pub notifier: Arc<dyn Notifier>,
}

impl PipelineDeps {
    /// Uses one backend for every store seam.
    pub fn from_store<S>(store: Arc<S>, notifier: Arc<dyn Notifier>) -> Self
    where
        S: TenantStore + LeadStore + DeliveryDedupeStore + InboundEventLog + 'static,
    {
        Self {
            tenants: store.clone(),
            leads: store.clone(),
            deliveries: store.clone(),
            events: store,
            notifier,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub gmail_verification_automation: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            gmail_verification_automation: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    LeadCreated { lead_id: String, notified: usize },
    DuplicateDelivery,
    DuplicateLead,
    Blocked(BlockReason),
    GmailVerification { code: Option<String> },
}

impl PipelineOutcome {
    fn event_name(&self) -> &'static str {
        match self {
            Self::LeadCreated { .. } => "lead_created",
            Self::DuplicateDelivery => "deduped",
            Self::DuplicateLead => "deduped_lead",
            Self::Blocked(_) => "blocked",
            Self::GmailVerification { .. } => "gmail_verification",
        }
    }

    fn event_detail(&self) -> Option<String> {
        match self {
            Self::LeadCreated { lead_id, .. } => Some(lead_id.clone()),
            Self::Blocked(reason) => Some(reason.to_string()),
            Self::GmailVerification { code } => code.clone(),
            Self::DuplicateDelivery | Self::DuplicateLead => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no tenant for inbound address {0:?}")]
    TenantNotFound(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub fn process_inbound_email(
    deps: &PipelineDeps,
    settings: PipelineSettings,
    payload: &InboundPayload,
) -> Result<PipelineOutcome, PipelineError> {
    let message = canonicalize(payload);
    let Some(tenant) = resolve_tenant(deps.tenants.as_ref(), &message.recipient)? else {
        return Err(PipelineError::TenantNotFound(message.recipient));
    };
    let now = Utc::now();
    let outcome = run_stages(deps, settings, &tenant, &message, now)?;
    info!(
        "inbound email tenant={} message_id={} outcome={}",
        tenant.id,
        message.message_id,
        outcome.event_name()
    );
    // A replayed delivery leaves no trace beyond the original.
    if outcome != PipelineOutcome::DuplicateDelivery {
        record_outcome(deps.events.as_ref(), &tenant, &message, &outcome, now);
    }
    Ok(outcome)
}

fn run_stages(
    deps: &PipelineDeps,
    settings: PipelineSettings,
    tenant: &Tenant,
    message: &InboundMessage,
    now: DateTime<Utc>,
) -> Result<PipelineOutcome, PipelineError> {
    let delivery = check_delivery(deps.deliveries.as_ref(), &message.anti_replay, now);
    if delivery.is_replay() {
        return Ok(PipelineOutcome::DuplicateDelivery);
    }

    match run_handshake(
        deps.tenants.as_ref(),
        tenant,
        message,
        settings.gmail_verification_automation,
        now,
    ) {
        HandshakeOutcome::ForwardingConfirmation { .. } => {
            return Ok(PipelineOutcome::GmailVerification { code: None });
        }
        HandshakeOutcome::CodeVerified { code } => {
            return Ok(PipelineOutcome::GmailVerification { code: Some(code) });
        }
        HandshakeOutcome::Continue => {}
    }

    if let Classification::Blocked(reason) = classify(message) {
        return Ok(PipelineOutcome::Blocked(reason));
    }

    let lead = derive_lead(tenant, message, now);
    match upsert_lead(deps.leads.as_ref(), &lead) {
        Ok(LeadUpsert::Created) => {
            let notified = notify_new_lead(deps.notifier.as_ref(), tenant, &lead);
            Ok(PipelineOutcome::LeadCreated {
                lead_id: lead.id,
                notified,
            })
        }
        Ok(LeadUpsert::AlreadyExists) => Ok(PipelineOutcome::DuplicateLead),
        Err(err) => {
            if let Some(key) = delivery.recorded_key() {
                if let Err(release_err) = deps.deliveries.release_delivery(key) {
                    error!(
                        "failed to release delivery record {} after lead insert failure: {}",
                        key, release_err
                    );
                }
            }
            Err(PipelineError::Store(err))
        }
    }
}

fn record_outcome(
    events: &dyn InboundEventLog,
    tenant: &Tenant,
    message: &InboundMessage,
    outcome: &PipelineOutcome,
    now: DateTime<Utc>,
) {
    let event = InboundEvent {
        id: Uuid::new_v4().to_string(),
        tenant_id: tenant.id.clone(),
        message_id: message.message_id.clone(),
        outcome: outcome.event_name().to_string(),
        detail: outcome.event_detail(),
        created_at: now,
    };
    if let Err(err) = events.record_event(&event) {
        error!(
            "failed to record inbound event {} for tenant {}: {}",
            event.outcome, tenant.id, err
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedupe::DeliveryDedupeRecord;
    use crate::lead::NewLead;
    use crate::notifier::NotifyError;
    use crate::tenant::ForwardingVerification;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        tenant: Mutex<Option<Tenant>>,
        deliveries: Mutex<Vec<String>>,
        leads: Mutex<Vec<NewLead>>,
        events: Mutex<Vec<String>>,
        fail_lead_insert: bool,
    }

    impl TenantStore for MemoryStore {
        fn find_by_inbound_address(&self, address: &str) -> Result<Option<Tenant>, StoreError> {
            Ok(self
                .tenant
                .lock()
                .unwrap()
                .clone()
                .filter(|tenant| tenant.inbound_address == address))
        }

        fn mark_forwarding_confirmed(
            &self,
            _tenant_id: &str,
            confirmed_at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            if let Some(tenant) = self.tenant.lock().unwrap().as_mut() {
                tenant.forwarding_confirmed = true;
                tenant.forwarding_confirmed_at.get_or_insert(confirmed_at);
            }
            Ok(())
        }

        fn record_forwarding_verification(
            &self,
            _tenant_id: &str,
            value: &str,
            state: ForwardingVerification,
        ) -> Result<(), StoreError> {
            if let Some(tenant) = self.tenant.lock().unwrap().as_mut() {
                tenant.verification = state;
                tenant.verification_code = Some(value.to_string());
            }
            Ok(())
        }
    }

    impl LeadStore for MemoryStore {
        fn insert_lead_if_absent(&self, lead: &NewLead) -> Result<bool, StoreError> {
            if self.fail_lead_insert {
                return Err(StoreError::Config("leads table offline".to_string()));
            }
            let mut leads = self.leads.lock().unwrap();
            if leads.iter().any(|existing| existing.message_id == lead.message_id) {
                return Ok(false);
            }
            leads.push(lead.clone());
            Ok(true)
        }
    }

    impl DeliveryDedupeStore for MemoryStore {
        fn insert_delivery(&self, record: &DeliveryDedupeRecord) -> Result<(), StoreError> {
            let mut deliveries = self.deliveries.lock().unwrap();
            if deliveries.contains(&record.signature_key) {
                return Err(StoreError::UniqueViolation("delivery_dedupe".to_string()));
            }
            deliveries.push(record.signature_key.clone());
            Ok(())
        }

        fn release_delivery(&self, signature_key: &str) -> Result<(), StoreError> {
            self.deliveries
                .lock()
                .unwrap()
                .retain(|key| key != signature_key);
            Ok(())
        }
    }

    impl InboundEventLog for MemoryStore {
        fn record_event(&self, event: &InboundEvent) -> Result<(), StoreError> {
            self.events.lock().unwrap().push(event.outcome.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingNotifier {
        sent: Mutex<usize>,
    }

    impl Notifier for CountingNotifier {
        fn send(&self, _to: &str, _body: &str) -> Result<(), NotifyError> {
            *self.sent.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn setup(fail_lead_insert: bool) -> (Arc<MemoryStore>, Arc<CountingNotifier>, PipelineDeps) {
        let store = Arc::new(MemoryStore {
            fail_lead_insert,
            ..Default::default()
        });
        *store.tenant.lock().unwrap() = Some(
            Tenant::new("tenant-1", "Acme", "acme@inbound.example")
                .with_notify_phones(["+61400000001"]),
        );
        let notifier = Arc::new(CountingNotifier::default());
        let deps = PipelineDeps::from_store(store.clone(), notifier.clone());
        (store, notifier, deps)
    }

    fn quote_request_to(recipient: &str) -> InboundPayload {
        InboundPayload::from_fields([
            ("subject", "Quote request"),
            ("body-plain", "Call me at 0412 345 678"),
            ("From", "Jane <jane@example.com>"),
            ("recipient", recipient),
            ("message-id", "abc-1"),
            ("timestamp", "1700000000"),
            ("token", "tok"),
            ("signature", "sig"),
        ])
    }

    fn quote_request() -> InboundPayload {
        quote_request_to("acme@inbound.example")
    }

    #[test]
    fn lead_created_once_and_replays_leave_no_events() {
        let (store, notifier, deps) = setup(false);
        let outcome = process_inbound_email(&deps, PipelineSettings::default(), &quote_request())
            .expect("process");
        assert!(matches!(outcome, PipelineOutcome::LeadCreated { notified: 1, .. }));

        for _ in 0..3 {
            let replay =
                process_inbound_email(&deps, PipelineSettings::default(), &quote_request())
                    .expect("replay");
            assert_eq!(replay, PipelineOutcome::DuplicateDelivery);
        }

        assert_eq!(store.leads.lock().unwrap().len(), 1);
        assert_eq!(*notifier.sent.lock().unwrap(), 1);
        assert_eq!(
            store.events.lock().unwrap().as_slice(),
            &["lead_created".to_string()]
        );
    }

    #[test]
    fn unknown_tenant_is_an_error() {
        let (store, _notifier, deps) = setup(false);
        let payload = quote_request_to("Nobody@Inbound.example");
        let err = process_inbound_email(&deps, PipelineSettings::default(), &payload)
            .expect_err("unknown tenant");
        assert!(matches!(err, PipelineError::TenantNotFound(ref addr) if addr == "nobody@inbound.example"));
        assert!(store.deliveries.lock().unwrap().is_empty());
        assert!(store.events.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_lead_insert_releases_delivery_record() {
        let (store, notifier, deps) = setup(true);
        let err = process_inbound_email(&deps, PipelineSettings::default(), &quote_request())
            .expect_err("store failure");
        assert!(matches!(err, PipelineError::Store(_)));
        assert!(store.deliveries.lock().unwrap().is_empty());
        assert_eq!(*notifier.sent.lock().unwrap(), 0);
    }

    #[test]
    fn blocked_mail_still_confirms_forwarding() {
        let (store, _notifier, deps) = setup(false);
        let payload = InboundPayload::from_fields([
            ("subject", "no"),
            ("body-plain", ""),
            ("From", "Jane <jane@example.com>"),
            ("recipient", "acme@inbound.example"),
        ]);
        let outcome =
            process_inbound_email(&deps, PipelineSettings::default(), &payload).expect("process");
        assert_eq!(outcome, PipelineOutcome::Blocked(BlockReason::EmptyContent));
        let tenant = store.tenant.lock().unwrap().clone().expect("tenant");
        assert!(tenant.forwarding_confirmed);
        assert!(store.leads.lock().unwrap().is_empty());
    }
}
