use send_sms_module::{SendSmsError, SendSmsParams, TwilioClient};
use tracing::{error, info, warn};

use crate::lead::{NewLead, UNKNOWN_PHONE};
use crate::tenant::Tenant;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("sms notifications are not configured")]
    NotConfigured,
    #[error("sms send failed: {0}")]
    Sms(#[from] SendSmsError),
}

pub trait Notifier: Send + Sync {
    fn send(&self, to: &str, body: &str) -> Result<(), NotifyError>;
}

/// Twilio-backed notifier sending from a fixed number.
pub struct SmsNotifier {
    client: TwilioClient,
    from: String,
}

impl SmsNotifier {
    pub fn new(client: TwilioClient, from: impl Into<String>) -> Self {
        Self {
            client,
            from: from.into(),
        }
    }
}

impl Notifier for SmsNotifier {
    fn send(&self, to: &str, body: &str) -> Result<(), NotifyError> {
        let params = SendSmsParams {
            to: to.to_string(),
            from: self.from.clone(),
            body: body.to_string(),
        };
        self.client.send(&params)?;
        Ok(())
    }
}

/// Stand-in used when no SMS credentials are configured.
pub struct DisabledNotifier;

impl Notifier for DisabledNotifier {
    fn send(&self, _to: &str, _body: &str) -> Result<(), NotifyError> {
        Err(NotifyError::NotConfigured)
    }
}

pub fn lead_alert_text(lead: &NewLead) -> String {
    if lead.phone == UNKNOWN_PHONE {
        format!("New lead: {} - {}", lead.name, lead.description)
    } else {
        format!("New lead: {} ({}) - {}", lead.name, lead.phone, lead.description)
    }
}

/// Sends the alert to every notify target. Returns how many sends succeeded;
/// failures are logged and never propagated.
pub fn notify_new_lead(notifier: &dyn Notifier, tenant: &Tenant, lead: &NewLead) -> usize {
    if tenant.notify_phones.is_empty() {
        warn!("tenant {} has no notification targets; lead {} not announced", tenant.id, lead.id);
        return 0;
    }
    let body = lead_alert_text(lead);
    let mut delivered = 0;
    for phone in &tenant.notify_phones {
        match notifier.send(phone, &body) {
            Ok(()) => {
                delivered += 1;
                info!("lead {} alert sent to {}", lead.id, phone);
            }
            Err(err) => error!("lead {} alert to {} failed: {}", lead.id, phone, err),
        }
    }
    delivered
}
