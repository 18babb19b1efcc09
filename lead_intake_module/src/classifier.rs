//! Hard filter chain separating genuine enquiries from automated mail.
//!
//! Rules live in [`HARD_FILTERS`] and run in table order; the first match decides
//! the block reason.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::canonical::InboundMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockReason {
    AutoSender,
    Autoresponder,
    Verification,
    Bounce,
    SocialAlert,
    Newsletter,
    EmptyContent,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoSender => "auto-sender",
            Self::Autoresponder => "autoresponder",
            Self::Verification => "verification",
            Self::Bounce => "bounce",
            Self::SocialAlert => "social-alert",
            Self::Newsletter => "newsletter",
            Self::EmptyContent => "empty-content",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Allowed,
    Blocked(BlockReason),
}

pub struct HardFilter {
    pub reason: BlockReason,
    pub matches: fn(&InboundMessage) -> bool,
}

pub static HARD_FILTERS: &[HardFilter] = &[
    HardFilter {
        reason: BlockReason::AutoSender,
        matches: is_auto_sender,
    },
    HardFilter {
        reason: BlockReason::Autoresponder,
        matches: has_autoresponder_headers,
    },
    HardFilter {
        reason: BlockReason::Verification,
        matches: is_verification_or_security,
    },
    HardFilter {
        reason: BlockReason::Bounce,
        matches: is_bounce,
    },
    HardFilter {
        reason: BlockReason::SocialAlert,
        matches: is_social_alert,
    },
    HardFilter {
        reason: BlockReason::Newsletter,
        matches: is_newsletter,
    },
    HardFilter {
        reason: BlockReason::EmptyContent,
        matches: is_contentless,
    },
];

pub fn classify(message: &InboundMessage) -> Classification {
    HARD_FILTERS
        .iter()
        .find(|filter| (filter.matches)(message))
        .map(|filter| Classification::Blocked(filter.reason))
        .unwrap_or(Classification::Allowed)
}

const AUTO_SENDER_LOCAL_PARTS: &[&str] = &[
    "noreply",
    "no-reply",
    "no_reply",
    "donotreply",
    "do-not-reply",
    "do_not_reply",
    "postmaster",
    "mailer-daemon",
    "autoreply",
    "auto-reply",
    "auto_reply",
    "autoresponder",
];

const AUTO_SUBMITTED_VALUES: &[&str] = &["auto-replied", "auto-generated", "auto-notified"];
const PRECEDENCE_VALUES: &[&str] = &["bulk", "list", "junk", "auto_reply", "auto-reply"];

// Sign-in and account-security senders only. Bare corporate domains stay out
// so staff writing from work addresses are not blocked.
const AUTH_PLATFORM_DOMAINS: &[&str] = &[
    "accounts.google.com",
    "facebookmail.com",
    "accountprotection.microsoft.com",
    "id.apple.com",
    "account.amazon.com",
    "mail.instagram.com",
    "security.linkedin.com",
    "verify.x.com",
    "verify.twitter.com",
];

static VERIFICATION_VOCABULARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(verification code|verify your (email|account)|confirm your (email|account)|one[- ]time (password|code|passcode)|otp|security (code|alert)|login (code|attempt|alert)|new sign[- ]in|sign[- ]in attempt|password reset|reset your password|two[- ]factor|2fa|confirmation code|suspicious activity)\b",
    )
    .unwrap()
});

const BOUNCE_SUBJECTS: &[&str] = &[
    "delivery status notification",
    "undeliverable",
    "undelivered mail",
    "delivery failure",
    "delivery has failed",
    "mail delivery failed",
    "returned mail",
    "failure notice",
    "message not delivered",
    "could not be delivered",
];

const SOCIAL_ALERT_SUBJECTS: &[&str] = &[
    "new follower",
    "started following you",
    "tagged you",
    "mentioned you",
    "commented on your",
    "liked your",
    "reacted to your",
    "new connection",
    "wants to connect",
    "invitation to connect",
    "friend request",
    "ads manager",
    "ad account",
    "boost your post",
    "your ad was",
    "your ad is",
    "page insights",
    "meta business suite",
    "facebook notification",
    "instagram notification",
];

const NEWSLETTER_BODY_PHRASES: &[&str] = &[
    "unsubscribe",
    "manage preferences",
    "manage your preferences",
    "email preferences",
    "update your preferences",
    "opt out",
    "opt-out",
    "view this email in your browser",
    "view in browser",
];

const PLACEHOLDER_SUBJECTS: &[&str] = &[
    "", "no", "na", "n/a", "-", ".", "test", "testing", "hi", "hey", "yo",
];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

fn is_auto_sender(message: &InboundMessage) -> bool {
    contains_any(message.sender.local_part(), AUTO_SENDER_LOCAL_PARTS)
}

fn has_autoresponder_headers(message: &InboundMessage) -> bool {
    let auto_submitted = message
        .header("auto-submitted")
        .map(|value| value.trim().to_ascii_lowercase())
        .is_some_and(|value| contains_any(&value, AUTO_SUBMITTED_VALUES));
    let precedence = message
        .header("precedence")
        .map(|value| value.trim().to_ascii_lowercase())
        .is_some_and(|value| PRECEDENCE_VALUES.contains(&value.as_str()));
    let autoreply_marker =
        message.header("x-autoreply").is_some() || message.header("x-autorespond").is_some();
    auto_submitted || precedence || autoreply_marker
}

fn is_verification_or_security(message: &InboundMessage) -> bool {
    if VERIFICATION_VOCABULARY.is_match(&message.normalized_subject)
        || VERIFICATION_VOCABULARY.is_match(&message.normalized_body)
    {
        return true;
    }
    message.sender.domain().is_some_and(|domain| {
        AUTH_PLATFORM_DOMAINS
            .iter()
            .any(|auth| domain == *auth || domain.ends_with(&format!(".{auth}")))
    })
}

fn is_bounce(message: &InboundMessage) -> bool {
    contains_any(&message.normalized_subject, BOUNCE_SUBJECTS)
}

fn is_social_alert(message: &InboundMessage) -> bool {
    contains_any(&message.normalized_subject, SOCIAL_ALERT_SUBJECTS)
}

fn is_newsletter(message: &InboundMessage) -> bool {
    let unsubscribe_field = message
        .list_unsubscribe
        .as_deref()
        .is_some_and(|value| !value.trim().is_empty());
    unsubscribe_field
        || message.header("list-unsubscribe").is_some()
        || contains_any(&message.normalized_body, NEWSLETTER_BODY_PHRASES)
}

fn is_contentless(message: &InboundMessage) -> bool {
    message.normalized_body.is_empty()
        && PLACEHOLDER_SUBJECTS.contains(&message.normalized_subject.trim())
}
