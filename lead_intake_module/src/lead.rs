use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::info;
use uuid::Uuid;

use crate::canonical::InboundMessage;
use crate::store::{LeadStore, StoreError};
use crate::tenant::Tenant;

pub const UNKNOWN_PHONE: &str = "unknown";
pub const LEAD_SOURCE_EMAIL: &str = "email";
pub const LEAD_STATUS_NEW: &str = "new";
pub const MAX_DESCRIPTION_CHARS: usize = 100;

const MIN_PHONE_DIGITS: usize = 8;
const MAX_PHONE_DIGITS: usize = 15;

static PHONE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\+?\(?\d[\d \t().\-]*\d").unwrap());
static PHONE_GROUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\+?\(?\d+\)?").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLead {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub description: String,
    pub source: String,
    pub status: String,
    /// Unique across all tenants; the idempotency key for the whole pipeline.
    pub message_id: String,
    pub created_at: DateTime<Utc>,
}

pub fn derive_lead(tenant: &Tenant, message: &InboundMessage, now: DateTime<Utc>) -> NewLead {
    let name = if message.sender.display_name.trim().is_empty() {
        message.sender.address.clone()
    } else {
        message.sender.display_name.trim().to_string()
    };
    let phone = extract_phone(&message.body).unwrap_or_else(|| UNKNOWN_PHONE.to_string());
    let description = if message.subject.trim().is_empty() {
        truncate_description(&message.body)
    } else {
        truncate_description(&message.subject)
    };

    NewLead {
        id: Uuid::new_v4().to_string(),
        tenant_id: tenant.id.clone(),
        name,
        email: message.sender.address.clone(),
        phone,
        description,
        source: LEAD_SOURCE_EMAIL.to_string(),
        status: LEAD_STATUS_NEW.to_string(),
        message_id: message.message_id.clone(),
        created_at: now,
    }
}

/// First phone-shaped number in `text`, reduced to digits with an optional
/// leading `+`. Numbers with too few or too many digits are skipped.
pub fn extract_phone(text: &str) -> Option<String> {
    PHONE_RUN
        .find_iter(text)
        .flat_map(|run| split_phone_run(run.as_str()))
        .find(|number| (MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&number.digits.len()))
        .map(PhoneNumber::formatted)
}

struct PhoneNumber {
    international: bool,
    digits: String,
}

impl PhoneNumber {
    fn is_country_code(&self) -> bool {
        self.international && self.digits.len() <= 3
    }

    fn formatted(self) -> String {
        if self.international {
            format!("+{}", self.digits)
        } else {
            self.digits
        }
    }
}

/// Splits a run of digit groups into separate numbers. A group with a leading
/// `+` or `0`, or a lone digit, opens a new number; fragments too short to be a
/// phone on their own are joined back together.
fn split_phone_run(run: &str) -> Vec<PhoneNumber> {
    let mut pieces: Vec<PhoneNumber> = Vec::new();
    for group in PHONE_GROUP.find_iter(run).map(|group| group.as_str()) {
        let digits: String = group.chars().filter(|ch| ch.is_ascii_digit()).collect();
        if !opens_number(group, &digits) {
            if let Some(last) = pieces.last_mut() {
                last.digits.push_str(&digits);
                continue;
            }
        }
        pieces.push(PhoneNumber {
            international: group.starts_with('+'),
            digits,
        });
    }

    let mut numbers: Vec<PhoneNumber> = Vec::new();
    for piece in pieces {
        let joins = numbers.last().is_some_and(|last| {
            last.digits.len() < MIN_PHONE_DIGITS
                && (piece.digits.len() < MIN_PHONE_DIGITS || last.is_country_code())
        });
        if joins {
            if let Some(last) = numbers.last_mut() {
                last.digits.push_str(&piece.digits);
                continue;
            }
        }
        numbers.push(piece);
    }
    numbers
}

// A bracketed group such as the `(0)` in `+61 (0)412` never opens a number.
fn opens_number(group: &str, digits: &str) -> bool {
    !group.starts_with('(')
        && (group.starts_with('+') || digits.len() == 1 || digits.starts_with('0'))
}

pub fn truncate_description(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.chars().count() <= MAX_DESCRIPTION_CHARS {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(MAX_DESCRIPTION_CHARS - 1).collect();
    out.push('…');
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadUpsert {
    Created,
    AlreadyExists,
}

pub fn upsert_lead(store: &dyn LeadStore, lead: &NewLead) -> Result<LeadUpsert, StoreError> {
    if store.insert_lead_if_absent(lead)? {
        info!(
            "lead created id={} tenant={} message_id={}",
            lead.id, lead.tenant_id, lead.message_id
        );
        Ok(LeadUpsert::Created)
    } else {
        info!(
            "lead already exists for message_id={}; skipping",
            lead.message_id
        );
        Ok(LeadUpsert::AlreadyExists)
    }
}
