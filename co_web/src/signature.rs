//! ABOUTME: HMAC-SHA256 verification for inbound provider webhooks
//! ABOUTME: Signature over the raw body; timestamp bounded by a replay window

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Why a webhook request was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    MissingSecret,
    MalformedSignature,
    Mismatch,
    ReplayWindowExceeded,
}

impl SignatureError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingSecret => "no webhook secret configured",
            Self::MalformedSignature => "malformed signature",
            Self::Mismatch => "signature mismatch",
            Self::ReplayWindowExceeded => "timestamp outside replay window",
        }
    }
}

/// Sign a body; used by tests and provider simulators
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify an inbound webhook.
///
/// The signature is HMAC-SHA256 over the raw request body, hex encoded.
/// `timestamp_secs` must be within the replay window of `now_secs` in
/// either direction.
pub fn verify(
    secret: Option<&str>,
    body: &[u8],
    signature_hex: &str,
    timestamp_secs: i64,
    now_secs: i64,
    replay_window: Duration,
) -> Result<(), SignatureError> {
    let Some(secret) = secret else {
        return Err(SignatureError::MissingSecret);
    };

    let skew = (now_secs - timestamp_secs).unsigned_abs();
    if skew > replay_window.as_secs() {
        return Err(SignatureError::ReplayWindowExceeded);
    }

    let signature = hex::decode(signature_hex.trim())
        .map_err(|_| SignatureError::MalformedSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(body);
    mac.verify_slice(&signature)
        .map_err(|_| SignatureError::Mismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "webhook-secret";
    const WINDOW: Duration = Duration::from_secs(300);

    #[test]
    fn test_roundtrip() {
        let body = br#"{"provider_message_id":"pm-1","event":"delivered"}"#;
        let signature = sign(SECRET, body);
        assert!(verify(Some(SECRET), body, &signature, 1_000, 1_000, WINDOW).is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let signature = sign(SECRET, b"original");
        assert_eq!(
            verify(Some(SECRET), b"tampered", &signature, 1_000, 1_000, WINDOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let signature = sign("other-secret", b"body");
        assert_eq!(
            verify(Some(SECRET), b"body", &signature, 1_000, 1_000, WINDOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_replay_window() {
        let signature = sign(SECRET, b"body");
        // 5 minutes plus a second: stale
        assert_eq!(
            verify(Some(SECRET), b"body", &signature, 1_000, 1_301, WINDOW),
            Err(SignatureError::ReplayWindowExceeded)
        );
        // Slight clock skew forward is tolerated
        assert!(verify(Some(SECRET), b"body", &signature, 1_100, 1_000, WINDOW).is_ok());
    }

    #[test]
    fn test_no_secret_configured_rejects() {
        let signature = sign(SECRET, b"body");
        assert_eq!(
            verify(None, b"body", &signature, 1_000, 1_000, WINDOW),
            Err(SignatureError::MissingSecret)
        );
    }

    #[test]
    fn test_garbage_signature_rejected() {
        assert_eq!(
            verify(Some(SECRET), b"body", "zz-not-hex", 1_000, 1_000, WINDOW),
            Err(SignatureError::MalformedSignature)
        );
    }
}
