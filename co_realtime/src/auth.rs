//! ABOUTME: JWT validation for the realtime authenticate handshake
//! ABOUTME: HS256 tokens with the user id in `sub`

use co_core::{Error, Result};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Claims carried by a session token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// User id
    pub sub: String,
    /// Expiry, seconds since the epoch
    pub exp: u64,
}

/// Verify a session token and return its user id
pub fn validate_session_token(token: &str, secret: &str) -> Result<String> {
    let token_data = decode::<SessionClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| Error::InvalidInput(format!("Invalid session token: {}", e)))?;

    Ok(token_data.claims.sub)
}

/// Issue a session token; used by tests and the bootstrap path
pub fn issue_session_token(user_id: &str, secret: &str, ttl_secs: u64) -> Result<String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let claims = SessionClaims {
        sub: user_id.to_string(),
        exp: now + ttl_secs,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| Error::Internal(format!("Failed to issue session token: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "valid32characterjwtsecretfortest";

    #[test]
    fn test_roundtrip() {
        let token = issue_session_token("u1", SECRET, 60).unwrap();
        let user_id = validate_session_token(&token, SECRET).unwrap();
        assert_eq!(user_id, "u1");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = issue_session_token("u1", SECRET, 60).unwrap();
        assert!(validate_session_token(&token, "another32characterjwtsecrethere!").is_err());
    }

    #[test]
    fn test_expired_rejected() {
        let claims = SessionClaims {
            sub: "u1".to_string(),
            exp: 1, // 1970
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert!(validate_session_token(&token, SECRET).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(validate_session_token("not-a-jwt", SECRET).is_err());
    }
}
