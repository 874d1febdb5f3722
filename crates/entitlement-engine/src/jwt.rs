//! Token expiry helpers and minimal JWT claim reading. Signatures are never
//! checked here; the backend is the authority on validity.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

#[derive(Deserialize)]
struct ExpClaim {
    exp: Option<i64>,
}

/// Returns true if `candidate` has the three dot-separated segments of a JWT.
pub(crate) fn looks_like_jwt(candidate: &str) -> bool {
    let candidate = candidate.trim();
    let segments: Vec<&str> = candidate.split('.').collect();
    segments.len() == 3
        && segments[0].starts_with("eyJ")
        && segments.iter().all(|s| {
            !s.is_empty()
                && s
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'=')
        })
}

/// Read the `exp` claim of a JWT.
pub fn expiry_from_jwt(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claim: ExpClaim = serde_json::from_slice(&bytes).ok()?;
    DateTime::from_timestamp(claim.exp?, 0)
}

/// `now` plus a relative lifetime in seconds. `None` when the result is not
/// representable, so a nonsensical `expires_in` reads as "no expiry given".
pub(crate) fn expiry_after(now: DateTime<Utc>, secs: i64) -> Option<DateTime<Utc>> {
    Duration::try_seconds(secs).and_then(|lifetime| now.checked_add_signed(lifetime))
}

#[cfg(test)]
pub(crate) fn encode_test_jwt(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"user-1","exp":{exp}}}"#));
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_from_jwt() {
        let token = encode_test_jwt(1_700_000_000);
        assert!(looks_like_jwt(&token));
        assert_eq!(
            expiry_from_jwt(&token),
            DateTime::from_timestamp(1_700_000_000, 0)
        );
    }

    #[test]
    fn test_expiry_after_rejects_out_of_range_lifetimes() {
        let now = Utc::now();
        assert_eq!(expiry_after(now, 60), Some(now + Duration::seconds(60)));
        assert_eq!(expiry_after(now, i64::MAX), None);
        assert_eq!(expiry_after(now, i64::MIN), None);
        assert_eq!(expiry_after(now, 9_000_000_000_000), None);
    }

    #[test]
    fn test_garbage_is_not_a_jwt() {
        assert!(!looks_like_jwt("not-a-token"));
        assert!(!looks_like_jwt("a.b"));
        assert!(!looks_like_jwt("eyJ.has space.x"));
        assert_eq!(expiry_from_jwt("eyJ.!!!.sig"), None);
    }
}
