//! Gmail forwarding handshake.
//!
//! Runs before content classification. A forwarding-confirmation email never
//! becomes a lead; a verification-code email only terminates the pipeline when a
//! code can actually be extracted.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{error, info, warn};

use crate::canonical::InboundMessage;
use crate::store::TenantStore;
use crate::tenant::{ForwardingVerification, Tenant};

const FORWARDING_CONFIRMATION_SENDER: &str = "forwarding-noreply@google.com";
const FORWARDING_CONFIRMATION_SUBJECT: &str = "gmail forwarding confirmation";

const GOOGLE_SYSTEM_SENDERS: &[&str] = &[
    "forwarding-noreply@google.com",
    "mail-noreply@google.com",
    "noreply@google.com",
    "no-reply@accounts.google.com",
];

const CODE_SUBJECT_PHRASES: &[&str] = &[
    "verification code",
    "confirmation code",
    "security code",
    "your code",
    "verify",
];

static CONFIRMATION_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"https://(?:mail|mail-settings|isolated\.mail)\.google\.com/mail/[^\s<>"'()\[\]]+"#,
    )
    .unwrap()
});

/// Tried in order; the first capture wins.
static CODE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)confirmation code:\s*(\d{6})\b",
        r"(?i)code is:?\s*(\d{6})\b",
        r"(?i)code:\s*(\d{6})\b",
        r"(?i)your code\D{0,20}(\d{6})\b",
        r"(?i)verification code\D{0,20}(\d{6})\b",
        r"\b(\d{6})\b",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Forwarding-confirmation email intercepted. `url` is `None` when no
    /// confirmation link could be found.
    ForwardingConfirmation { url: Option<String> },
    /// Verification code extracted and stored.
    CodeVerified { code: String },
    /// Not a handshake message; continue to classification.
    Continue,
}

impl HandshakeOutcome {
    pub fn terminates(&self) -> bool {
        !matches!(self, Self::Continue)
    }
}

pub fn is_forwarding_confirmation(message: &InboundMessage) -> bool {
    message
        .sender
        .address
        .contains(FORWARDING_CONFIRMATION_SENDER)
        && message
            .normalized_subject
            .contains(FORWARDING_CONFIRMATION_SUBJECT)
}

pub fn is_code_verification_candidate(message: &InboundMessage) -> bool {
    let address = message.sender.address.as_str();
    if GOOGLE_SYSTEM_SENDERS.contains(&address) {
        return true;
    }
    message.sender.domain() == Some("google.com")
        && CODE_SUBJECT_PHRASES
            .iter()
            .any(|phrase| message.normalized_subject.contains(phrase))
}

pub fn extract_confirmation_url(message: &InboundMessage) -> Option<String> {
    let from_body = CONFIRMATION_URL
        .find(&message.body)
        .map(|found| found.as_str().to_string());
    from_body.or_else(|| {
        let html = message.html.as_deref()?;
        CONFIRMATION_URL
            .find(html)
            .map(|found| found.as_str().replace("&amp;", "&"))
    })
}

pub fn extract_verification_code(text: &str) -> Option<String> {
    CODE_PATTERNS
        .iter()
        .find_map(|pattern| pattern.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|code| code.as_str().to_string())
}

/// Applies the handshake transitions for one message. Store failures are
/// logged; the outcome is decided by the message alone.
pub fn run_handshake(
    store: &dyn TenantStore,
    tenant: &Tenant,
    message: &InboundMessage,
    gmail_automation: bool,
    now: DateTime<Utc>,
) -> HandshakeOutcome {
    if gmail_automation && is_forwarding_confirmation(message) {
        let url = extract_confirmation_url(message);
        match &url {
            Some(url) => {
                info!("gmail forwarding confirmation for tenant {}", tenant.id);
                if let Err(err) = store.record_forwarding_verification(
                    &tenant.id,
                    url,
                    ForwardingVerification::CodeReceived,
                ) {
                    error!(
                        "failed to store forwarding confirmation url for tenant {}: {}",
                        tenant.id, err
                    );
                }
            }
            None => warn!(
                "gmail forwarding confirmation for tenant {} has no confirmation link",
                tenant.id
            ),
        }
        return HandshakeOutcome::ForwardingConfirmation { url };
    }

    if !tenant.forwarding_confirmed {
        match store.mark_forwarding_confirmed(&tenant.id, now) {
            Ok(()) => info!("first inbound email; forwarding confirmed for tenant {}", tenant.id),
            Err(err) => error!(
                "failed to mark forwarding confirmed for tenant {}: {}",
                tenant.id, err
            ),
        }
    }

    if gmail_automation && is_code_verification_candidate(message) {
        match extract_verification_code(&message.body) {
            Some(code) => {
                info!("gmail verification code received for tenant {}", tenant.id);
                if let Err(err) = store.record_forwarding_verification(
                    &tenant.id,
                    &code,
                    ForwardingVerification::CodeVerified,
                ) {
                    error!(
                        "failed to store verification code for tenant {}: {}",
                        tenant.id, err
                    );
                }
                return HandshakeOutcome::CodeVerified { code };
            }
            None => info!(
                "google system email for tenant {} carried no code; classifying normally",
                tenant.id
            ),
        }
    }

    HandshakeOutcome::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{canonicalize, InboundPayload};
    use crate::store::StoreError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTenants {
        confirmed: Mutex<Vec<String>>,
        verification: Mutex<Vec<(String, ForwardingVerification)>>,
    }

    impl TenantStore for RecordingTenants {
        fn find_by_inbound_address(&self, _address: &str) -> Result<Option<Tenant>, StoreError> {
            Ok(None)
        }

        fn mark_forwarding_confirmed(
            &self,
            tenant_id: &str,
            _confirmed_at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.confirmed.lock().unwrap().push(tenant_id.to_string());
            Ok(())
        }

        fn record_forwarding_verification(
            &self,
            _tenant_id: &str,
            value: &str,
            state: ForwardingVerification,
        ) -> Result<(), StoreError> {
            self.verification
                .lock()
                .unwrap()
                .push((value.to_string(), state));
            Ok(())
        }
    }

    fn message(fields: &[(&str, &str)]) -> InboundMessage {
        canonicalize(&InboundPayload::from_fields(fields.iter().copied()))
    }

    fn tenant() -> Tenant {
        Tenant::new("tenant-1", "Acme", "acme@inbound.example")
    }

    fn confirmation_email(body: &str) -> InboundMessage {
        message(&[
            ("From", "Gmail Team <forwarding-noreply@google.com>"),
            ("subject", "(#123) Gmail Forwarding Confirmation - Please Read"),
            ("body-plain", body),
        ])
    }

    #[test]
    fn confirmation_email_stores_url_and_terminates() {
        let store = RecordingTenants::default();
        let email = confirmation_email(
            "To allow forwarding click https://mail-settings.google.com/mail/vf-%5BABC%5D-xyz Call 0412 345 678",
        );
        let outcome = run_handshake(&store, &tenant(), &email, true, Utc::now());
        assert_eq!(
            outcome,
            HandshakeOutcome::ForwardingConfirmation {
                url: Some("https://mail-settings.google.com/mail/vf-%5BABC%5D-xyz".to_string())
            }
        );
        assert_eq!(
            store.verification.lock().unwrap().as_slice(),
            &[(
                "https://mail-settings.google.com/mail/vf-%5BABC%5D-xyz".to_string(),
                ForwardingVerification::CodeReceived
            )]
        );
        assert!(store.confirmed.lock().unwrap().is_empty());
    }

    #[test]
    fn confirmation_email_without_link_still_terminates() {
        let store = RecordingTenants::default();
        let outcome = run_handshake(
            &store,
            &tenant(),
            &confirmation_email("no link in here"),
            true,
            Utc::now(),
        );
        assert_eq!(outcome, HandshakeOutcome::ForwardingConfirmation { url: None });
        assert!(store.verification.lock().unwrap().is_empty());
    }

    #[test]
    fn confirmation_url_falls_back_to_html() {
        let email = message(&[
            ("From", "forwarding-noreply@google.com"),
            ("subject", "Gmail Forwarding Confirmation"),
            (
                "body-html",
                r#"<a href="https://mail.google.com/mail/vf-abc?x=1&amp;y=2">confirm</a>"#,
            ),
        ]);
        assert_eq!(
            extract_confirmation_url(&email).as_deref(),
            Some("https://mail.google.com/mail/vf-abc?x=1&y=2")
        );
    }

    #[test]
    fn code_email_marks_confirmed_then_stores_code() {
        let store = RecordingTenants::default();
        let email = message(&[
            ("From", "Google <noreply@google.com>"),
            ("subject", "Your verification code"),
            ("body-plain", "Your confirmation code: 482913. It expires soon."),
        ]);
        let outcome = run_handshake(&store, &tenant(), &email, true, Utc::now());
        assert_eq!(
            outcome,
            HandshakeOutcome::CodeVerified {
                code: "482913".to_string()
            }
        );
        assert_eq!(store.confirmed.lock().unwrap().as_slice(), &["tenant-1".to_string()]);
        assert_eq!(
            store.verification.lock().unwrap().as_slice(),
            &[("482913".to_string(), ForwardingVerification::CodeVerified)]
        );
    }

    #[test]
    fn code_candidate_without_code_continues() {
        let store = RecordingTenants::default();
        let email = message(&[
            ("From", "alerts@google.com"),
            ("subject", "Verify your settings"),
            ("body-plain", "Nothing numeric here"),
        ]);
        assert!(is_code_verification_candidate(&email));
        let outcome = run_handshake(&store, &tenant(), &email, true, Utc::now());
        assert_eq!(outcome, HandshakeOutcome::Continue);
    }

    #[test]
    fn genuine_email_only_marks_confirmed_once() {
        let store = RecordingTenants::default();
        let email = message(&[
            ("From", "Jane <jane@example.com>"),
            ("subject", "Quote request"),
            ("body-plain", "Call me"),
        ]);
        let outcome = run_handshake(&store, &tenant(), &email, true, Utc::now());
        assert_eq!(outcome, HandshakeOutcome::Continue);
        assert_eq!(store.confirmed.lock().unwrap().len(), 1);

        let mut confirmed = tenant();
        confirmed.forwarding_confirmed = true;
        run_handshake(&store, &confirmed, &email, true, Utc::now());
        assert_eq!(store.confirmed.lock().unwrap().len(), 1);
    }

    #[test]
    fn disabled_automation_skips_gmail_steps() {
        let store = RecordingTenants::default();
        let email = confirmation_email("https://mail.google.com/mail/vf-abc");
        let outcome = run_handshake(&store, &tenant(), &email, false, Utc::now());
        assert_eq!(outcome, HandshakeOutcome::Continue);
        assert!(store.verification.lock().unwrap().is_empty());
        assert_eq!(store.confirmed.lock().unwrap().len(), 1);
    }

    #[test]
    fn code_patterns_are_layered() {
        assert_eq!(
            extract_verification_code("Order 123456. Your code is 654321").as_deref(),
            Some("654321")
        );
        assert_eq!(
            extract_verification_code("Use 777888 to finish").as_deref(),
            Some("777888")
        );
        assert_eq!(extract_verification_code("call 0412345678"), None);
    }
}
