use axum::http::StatusCode;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::canonical::AntiReplayFields;

/// Checks the Mailgun webhook signature:
/// `hex(HMAC-SHA256(signing_key, timestamp || token)) == signature`.
pub(super) fn verify_mailgun(
    signing_key: Option<&str>,
    require_signature: bool,
    fields: &AntiReplayFields,
) -> Result<(), &'static str> {
    let Some(signing_key) = signing_key.filter(|value| !value.trim().is_empty()) else {
        if require_signature {
            return Err("signing_key_not_configured");
        }
        return Ok(());
    };
    let (timestamp, token, signature) = fields.complete().ok_or("missing_signature")?;
    let expected = hex::decode(signature.trim()).map_err(|_| "invalid_signature")?;

    let mut mac =
        Hmac::<Sha256>::new_from_slice(signing_key.as_bytes()).map_err(|_| "bad_secret")?;
    mac.update(timestamp.as_bytes());
    mac.update(token.as_bytes());
    mac.verify_slice(&expected).map_err(|_| "invalid_signature")
}

pub(super) fn rejection_status(reason: &str) -> StatusCode {
    match reason {
        "missing_signature" => StatusCode::UNAUTHORIZED,
        "invalid_signature" => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign_for_tests(signing_key: &str, timestamp: &str, token: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(signing_key.as_bytes()).unwrap();
        mac.update(timestamp.as_bytes());
        mac.update(token.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn fields(signature: Option<&str>) -> AntiReplayFields {
        AntiReplayFields {
            timestamp: Some("1700000000".to_string()),
            token: Some("tok".to_string()),
            signature: signature.map(str::to_string),
        }
    }

    #[test]
    fn valid_signature_passes() {
        let signature = sign_for_tests("key-123", "1700000000", "tok");
        assert_eq!(
            verify_mailgun(Some("key-123"), true, &fields(Some(&signature))),
            Ok(())
        );
    }

    #[test]
    fn tampered_or_missing_signature_is_rejected() {
        let signature = sign_for_tests("other-key", "1700000000", "tok");
        assert_eq!(
            verify_mailgun(Some("key-123"), false, &fields(Some(&signature))),
            Err("invalid_signature")
        );
        assert_eq!(
            verify_mailgun(Some("key-123"), false, &fields(Some("not-hex"))),
            Err("invalid_signature")
        );
        assert_eq!(
            verify_mailgun(Some("key-123"), false, &fields(None)),
            Err("missing_signature")
        );
    }

    #[test]
    fn missing_key_depends_on_requirement() {
        assert_eq!(verify_mailgun(None, false, &fields(None)), Ok(()));
        assert_eq!(
            verify_mailgun(None, true, &fields(None)),
            Err("signing_key_not_configured")
        );
        assert_eq!(rejection_status("missing_signature"), StatusCode::UNAUTHORIZED);
        assert_eq!(rejection_status("invalid_signature"), StatusCode::FORBIDDEN);
        assert_eq!(
            rejection_status("signing_key_not_configured"),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
