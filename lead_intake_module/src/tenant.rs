use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::store::{StoreError, TenantStore};

/// Progress of the mailbox provider's forwarding verification for a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardingVerification {
    #[default]
    Unset,
    /// A confirmation link or code arrived but completion happens out-of-band.
    CodeReceived,
    CodeVerified,
}

impl ForwardingVerification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::CodeReceived => "code_received",
            Self::CodeVerified => "code_verified",
        }
    }
}

impl fmt::Display for ForwardingVerification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForwardingVerification {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "" | "unset" => Ok(Self::Unset),
            "code_received" => Ok(Self::CodeReceived),
            "code_verified" => Ok(Self::CodeVerified),
            other => Err(format!("unknown forwarding verification state: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    /// Unique, lowercase.
    pub inbound_address: String,
    pub forwarding_confirmed: bool,
    pub forwarding_confirmed_at: Option<DateTime<Utc>>,
    pub verification: ForwardingVerification,
    /// Numeric code or confirmation URL, whichever the provider sent last.
    pub verification_code: Option<String>,
    pub notify_phones: Vec<String>,
}

impl Tenant {
    pub fn new(id: impl Into<String>, name: impl Into<String>, inbound_address: &str) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            inbound_address: normalize_inbound_address(inbound_address),
            forwarding_confirmed: false,
            forwarding_confirmed_at: None,
            verification: ForwardingVerification::Unset,
            verification_code: None,
            notify_phones: Vec::new(),
        }
    }

    pub fn with_notify_phones<I, S>(mut self, phones: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.notify_phones = phones.into_iter().map(Into::into).collect();
        self
    }

    pub fn forwarding_verified(&self) -> bool {
        self.verification == ForwardingVerification::CodeVerified
    }
}

pub fn normalize_inbound_address(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

/// Exact lookup of the canonical recipient. An empty recipient never matches.
pub fn resolve_tenant(
    store: &dyn TenantStore,
    recipient: &str,
) -> Result<Option<Tenant>, StoreError> {
    let address = normalize_inbound_address(recipient);
    if address.is_empty() {
        warn!("inbound email has no recipient address");
        return Ok(None);
    }
    let tenant = store.find_by_inbound_address(&address)?;
    match &tenant {
        Some(tenant) => info!("resolved inbound address {} to tenant {}", address, tenant.id),
        None => warn!("no tenant for inbound address {}", address),
    }
    Ok(tenant)
}

pub(crate) fn join_phones(phones: &[String]) -> String {
    phones
        .iter()
        .map(|phone| phone.trim())
        .filter(|phone| !phone.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn split_phones(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|phone| !phone.is_empty())
        .map(str::to_string)
        .collect()
}
