//! Canonicalization of raw inbound-email webhook fields.
//!
//! The webhook delivers a loosely-typed bag of form fields. Everything past this
//! module works on [`InboundMessage`], built once here with every comparison-ready
//! field derived from its raw counterpart.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::html::{collapse_whitespace, html_to_text};

static ANGLE_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*"?(?P<name>[^"<]*?)"?\s*<(?P<addr>[^<>\s]+)>"#).unwrap()
});

const SUBJECT_FIELDS: &[&str] = &["subject", "Subject"];
const STRIPPED_TEXT_FIELDS: &[&str] = &["stripped-text"];
const PLAIN_TEXT_FIELDS: &[&str] = &["body-plain"];
const HTML_FIELDS: &[&str] = &["stripped-html", "body-html"];
const FROM_FIELDS: &[&str] = &["From", "from", "sender"];
const RECIPIENT_FIELDS: &[&str] = &["recipient", "Recipient", "to", "To"];
const MESSAGE_ID_FIELDS: &[&str] = &["Message-Id", "message-id", "Message-ID"];
const HEADERS_FIELD: &str = "message-headers";
const LIST_UNSUBSCRIBE_FIELD: &str = "List-Unsubscribe";

const FORWARDED_TO_HEADERS: &[&str] = &[
    "x-forwarded-to",
    "x-original-to",
    "delivered-to",
    "envelope-to",
];

/// Raw webhook form fields exactly as the provider posted them.
#[derive(Debug, Clone, Default)]
pub struct InboundPayload {
    fields: HashMap<String, String>,
}

impl InboundPayload {
    pub fn from_fields<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = HashMap::new();
        for (key, value) in fields {
            map.entry(key.into()).or_insert_with(|| value.into());
        }
        Self { fields: map }
    }

    pub fn from_urlencoded(body: &[u8]) -> Result<Self, serde_urlencoded::de::Error> {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(body)?;
        Ok(Self::from_fields(pairs))
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.entry(key.into()).or_insert_with(|| value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn anti_replay_fields(&self) -> AntiReplayFields {
        AntiReplayFields {
            timestamp: self.first_of(&["timestamp"]).map(str::to_string),
            token: self.first_of(&["token"]).map(str::to_string),
            signature: self.first_of(&["signature"]).map(str::to_string),
        }
    }

    /// First non-blank value among `names`.
    fn first_of(&self, names: &[&str]) -> Option<&str> {
        names
            .iter()
            .filter_map(|name| self.get(name))
            .find(|value| !value.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub display_name: String,
    /// Lowercased address, or the whole raw header when no `<addr>` form was found.
    pub address: String,
}

impl Sender {
    pub fn domain(&self) -> Option<&str> {
        self.address
            .rsplit_once('@')
            .map(|(_, domain)| domain.trim_end_matches('>'))
    }

    pub fn local_part(&self) -> &str {
        self.address
            .split_once('@')
            .map(|(local, _)| local)
            .unwrap_or(&self.address)
    }
}

/// Provider anti-replay fields. Any of them may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AntiReplayFields {
    pub timestamp: Option<String>,
    pub token: Option<String>,
    pub signature: Option<String>,
}

impl AntiReplayFields {
    pub fn complete(&self) -> Option<(&str, &str, &str)> {
        match (&self.timestamp, &self.token, &self.signature) {
            (Some(timestamp), Some(token), Some(signature)) => {
                Some((timestamp.as_str(), token.as_str(), signature.as_str()))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub recipient: String,
    pub sender: Sender,
    pub subject: String,
    pub normalized_subject: String,
    pub body: String,
    pub normalized_body: String,
    /// Raw HTML part, kept for link extraction only.
    pub html: Option<String>,
    pub message_id: String,
    /// The provider sent no message id and one was generated for this delivery.
    pub message_id_generated: bool,
    pub headers: HashMap<String, String>,
    pub list_unsubscribe: Option<String>,
    pub anti_replay: AntiReplayFields,
}

impl InboundMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Builds an [`InboundMessage`] from raw webhook fields. Never fails; absent
/// fields become empty strings or `None`.
pub fn canonicalize(payload: &InboundPayload) -> InboundMessage {
    let headers = parse_headers(payload.get(HEADERS_FIELD));

    let subject = payload
        .first_of(SUBJECT_FIELDS)
        .or_else(|| headers.get("subject").map(String::as_str))
        .unwrap_or("")
        .to_string();
    let normalized_subject = subject.trim().to_lowercase();

    let html = payload.first_of(HTML_FIELDS).map(str::to_string);
    let body = payload
        .first_of(STRIPPED_TEXT_FIELDS)
        .or_else(|| payload.first_of(PLAIN_TEXT_FIELDS))
        .map(|text| text.trim().to_string())
        .or_else(|| html.as_deref().map(html_to_text))
        .unwrap_or_default();
    let normalized_body = collapse_whitespace(&body).to_lowercase();

    let raw_from = payload
        .first_of(FROM_FIELDS)
        .or_else(|| headers.get("from").map(String::as_str))
        .unwrap_or("");
    let sender = parse_sender(raw_from);

    let recipient = payload
        .first_of(RECIPIENT_FIELDS)
        .or_else(|| {
            FORWARDED_TO_HEADERS
                .iter()
                .filter_map(|name| headers.get(*name).map(String::as_str))
                .find(|value| !value.trim().is_empty())
        })
        .map(normalize_recipient)
        .unwrap_or_default();

    let provided_id = payload
        .first_of(MESSAGE_ID_FIELDS)
        .or_else(|| headers.get("message-id").map(String::as_str))
        .and_then(normalize_message_id);
    let (message_id, message_id_generated) = match provided_id {
        Some(id) => (id, false),
        None => {
            let generated = Uuid::new_v4().to_string();
            warn!(
                "inbound email has no message id; generated {} (retries of this message will not be recognised)",
                generated
            );
            (generated, true)
        }
    };

    let list_unsubscribe = payload
        .first_of(&[LIST_UNSUBSCRIBE_FIELD])
        .map(str::to_string);

    let anti_replay = payload.anti_replay_fields();

    InboundMessage {
        recipient,
        sender,
        subject,
        normalized_subject,
        body,
        normalized_body,
        html,
        message_id,
        message_id_generated,
        headers,
        list_unsubscribe,
        anti_replay,
    }
}

/// Parses `"Display Name" <addr@domain>`; anything else is kept whole as both
/// name and address.
pub fn parse_sender(raw: &str) -> Sender {
    let raw = raw.trim();
    if let Some(caps) = ANGLE_ADDRESS.captures(raw) {
        let address = caps["addr"].trim().to_lowercase();
        let name = caps["name"].trim().trim_matches('"').trim();
        let display_name = if name.is_empty() {
            address.clone()
        } else {
            name.to_string()
        };
        return Sender {
            display_name,
            address,
        };
    }
    Sender {
        display_name: raw.to_string(),
        address: raw.to_lowercase(),
    }
}

pub(crate) fn normalize_message_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_matches(|ch| matches!(ch, '<' | '>')).trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_ascii_lowercase())
}

fn normalize_recipient(raw: &str) -> String {
    let first = raw.split(',').next().unwrap_or("").trim();
    let address = match (first.find('<'), first.rfind('>')) {
        (Some(start), Some(end)) if start < end => &first[start + 1..end],
        _ => first,
    };
    address.trim().to_lowercase()
}

fn parse_headers(raw: Option<&str>) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    let Some(raw) = raw.filter(|value| !value.trim().is_empty()) else {
        return headers;
    };
    match serde_json::from_str::<Vec<(String, String)>>(raw) {
        Ok(pairs) => {
            for (name, value) in pairs {
                headers
                    .entry(name.trim().to_ascii_lowercase())
                    .or_insert(value);
            }
        }
        Err(err) => {
            debug!("ignoring unparseable message-headers field: {}", err);
        }
    }
    headers
}
