/// Signed session tokens handed to clients after login
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SecurityConfig;
use crate::crypto::CryptoError;
use crate::error::{Error, Result};
use crate::types::Id;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct SessionTokens {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    lifespan: Duration,
}

impl SessionTokens {
    pub fn new(secret: &[u8], issuer: impl Into<String>, lifespan: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            issuer: issuer.into(),
            lifespan,
        }
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        Self::new(
            config.jwt_secret.as_bytes(),
            config.jwt_issuer.clone(),
            Duration::minutes(config.jwt_lifespan_minutes),
        )
    }

    pub fn issue(&self, user_id: Id) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: (now + self.lifespan).timestamp(),
        };

        encode(&Header::new(Algorithm::HS512), &claims, &self.encoding)
            .map_err(|e| {
                warn!("Failed to sign session token: {}", e);
                Error::Crypto(CryptoError::Encrypt)
            })
    }

    /// The user id carried by a valid, unexpired token from this issuer
    pub fn verify(&self, token: &str) -> Result<Id> {
        let mut validation = Validation::new(Algorithm::HS512);
        validation.set_issuer(&[self.issuer.as_str()]);

        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            debug!("Session token rejected: {}", e);
            Error::Unauthorized("invalid or expired session token")
        })?;

        data.claims
            .sub
            .parse()
            .map_err(|_| Error::Unauthorized("invalid or expired session token"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens() -> SessionTokens {
        SessionTokens::new(b"jwt-secret", "orbit", Duration::minutes(60))
    }

    #[test]
    fn test_issue_and_verify() {
        let tokens = tokens();
        let jwt = tokens.issue(42).unwrap();
        assert_eq!(tokens.verify(&jwt).unwrap(), 42);
    }

    #[test]
    fn test_rejects_foreign_signature() {
        let other = SessionTokens::new(b"other-secret", "orbit", Duration::minutes(60));
        let jwt = other.issue(42).unwrap();
        assert!(matches!(tokens().verify(&jwt), Err(Error::Unauthorized(_))));
    }

    #[test]
    fn test_rejects_wrong_issuer() {
        let other = SessionTokens::new(b"jwt-secret", "someone-else", Duration::minutes(60));
        let jwt = other.issue(42).unwrap();
        assert!(matches!(tokens().verify(&jwt), Err(Error::Unauthorized(_))));
    }

    #[test]
    fn test_rejects_expired() {
        // Past the default 60s validation leeway
        let stale = SessionTokens::new(b"jwt-secret", "orbit", Duration::minutes(-5));
        let jwt = stale.issue(42).unwrap();
        assert!(matches!(stale.verify(&jwt), Err(Error::Unauthorized(_))));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(tokens().verify("not.a.jwt").is_err());
    }
}
