//! Delivery-level dedupe of webhook retries.
//!
//! The key is derived only from the provider's anti-replay fields, never from
//! message content. Recording is insert-first: the store's uniqueness violation
//! is the duplicate signal.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{error, warn};

use crate::canonical::AntiReplayFields;
use crate::store::{DeliveryDedupeStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryDedupeRecord {
    pub signature_key: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryCheck {
    /// First time this delivery was seen; the key is now recorded.
    FirstSeen { signature_key: String },
    /// A previous delivery with the same anti-replay fields was already recorded.
    Replayed,
    /// Anti-replay fields incomplete; dedupe skipped.
    Unsigned,
    /// The store failed for a reason other than a duplicate; processing continues.
    StoreUnavailable,
}

impl DeliveryCheck {
    pub fn is_replay(&self) -> bool {
        matches!(self, Self::Replayed)
    }

    pub fn recorded_key(&self) -> Option<&str> {
        match self {
            Self::FirstSeen { signature_key } => Some(signature_key),
            _ => None,
        }
    }
}

pub fn delivery_signature_key(timestamp: &str, token: &str, signature: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.as_bytes());
    hasher.update(token.as_bytes());
    hasher.update(signature.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn check_delivery(
    store: &dyn DeliveryDedupeStore,
    fields: &AntiReplayFields,
    received_at: DateTime<Utc>,
) -> DeliveryCheck {
    let Some((timestamp, token, signature)) = fields.complete() else {
        warn!("inbound webhook missing timestamp/token/signature; delivery dedupe skipped");
        return DeliveryCheck::Unsigned;
    };
    let record = DeliveryDedupeRecord {
        signature_key: delivery_signature_key(timestamp, token, signature),
        received_at,
    };
    match store.insert_delivery(&record) {
        Ok(()) => DeliveryCheck::FirstSeen {
            signature_key: record.signature_key,
        },
        Err(StoreError::UniqueViolation(_)) => DeliveryCheck::Replayed,
        Err(err) => {
            error!(
                "delivery dedupe insert failed for key {}; continuing without dedupe: {}",
                record.signature_key, err
            );
            DeliveryCheck::StoreUnavailable
        }
    }
}
