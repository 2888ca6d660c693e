//! Signed gateway session tokens (HS256 JWT)

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Claims carried by a gateway session token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Opaque session subject
    pub sub: String,
    /// Issued at (unix seconds)
    pub iat: u64,
    /// Expiry (unix seconds)
    pub exp: u64,
}

/// Issues and verifies gateway session tokens
pub struct SessionTokens {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl SessionTokens {
    /// Create a token service from an HMAC secret
    #[must_use]
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 5;
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl,
        }
    }

    /// Token lifetime
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a fresh token
    pub fn issue(&self) -> Result<String> {
        let now = unix_now();
        self.sign(&SessionClaims {
            sub: uuid::Uuid::new_v4().to_string(),
            iat: now,
            exp: now + self.ttl.as_secs(),
        })
    }

    /// Verify signature and expiry
    pub fn verify(&self, token: &str) -> Result<SessionClaims> {
        if token.is_empty() {
            return Err(Error::Session("missing session id".to_string()));
        }
        decode::<SessionClaims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| Error::Session(format!("invalid session token: {e}")))
    }

    pub(crate) fn sign(&self, claims: &SessionClaims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("cannot sign session token: {e}")))
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens() -> SessionTokens {
        SessionTokens::new(b"test-signing-key", Duration::from_secs(3600))
    }

    #[test]
    fn issued_tokens_verify() {
        let tokens = tokens();
        let token = tokens.issue().unwrap();
        let claims = tokens.verify(&token).unwrap();
        assert!(claims.exp > claims.iat);
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn tokens_are_unique() {
        let tokens = tokens();
        assert_ne!(tokens.issue().unwrap(), tokens.issue().unwrap());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let token = tokens().issue().unwrap();
        let other = SessionTokens::new(b"another-key", Duration::from_secs(3600));
        assert!(matches!(other.verify(&token), Err(Error::Session(_))));
    }

    #[test]
    fn expired_token_is_rejected() {
        let tokens = tokens();
        let now = unix_now();
        let token = tokens
            .sign(&SessionClaims {
                sub: "old".to_string(),
                iat: now - 7200,
                exp: now - 3600,
            })
            .unwrap();
        assert!(matches!(tokens.verify(&token), Err(Error::Session(_))));
    }

    #[test]
    fn garbage_and_empty_are_rejected() {
        let tokens = tokens();
        assert!(tokens.verify("").is_err());
        assert!(tokens.verify("not.a.jwt").is_err());
    }
}
