//! HS256 bearer tokens
//!
//! Tokens carry the principal id and role; verification checks signature
//! and expiry only. Wallet signature checks happen before a token is issued
//! and are not part of this service.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::{IdentityVerifier, TokenIssuer, VerifiedPrincipal};
use crate::db::principals::{Principal, Role};
use crate::error::HealthError;

/// Minimum secret length accepted outside dev mode
pub const MIN_SECRET_LEN: usize = 32;

/// Payload stored in the token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Principal id
    pub sub: String,
    pub role: Role,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

#[derive(Clone)]
pub struct JwtIdentity {
    secret: String,
    expiry_seconds: u64,
}

impl JwtIdentity {
    pub fn new(secret: String, expiry_seconds: u64) -> Result<Self, HealthError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(HealthError::Config(format!(
                "jwt_secret must be at least {} characters",
                MIN_SECRET_LEN
            )));
        }

        Ok(Self { secret, expiry_seconds })
    }

    /// Fixed secret for local development and tests
    pub fn new_dev() -> Self {
        Self {
            secret: "dev-mode-secret-not-for-production-use-123456".into(),
            expiry_seconds: 3600,
        }
    }

    fn now() -> Result<u64, HealthError> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .map_err(|e| HealthError::Auth(format!("System time error: {}", e)))
    }
}

impl TokenIssuer for JwtIdentity {
    fn issue(&self, principal: &Principal) -> Result<String, HealthError> {
        let now = Self::now()?;
        let claims = Claims {
            sub: principal.id.clone(),
            role: principal.role,
            iat: now,
            exp: now + self.expiry_seconds,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| HealthError::Auth(format!("Failed to generate token: {}", e)))
    }
}

#[async_trait]
impl IdentityVerifier for JwtIdentity {
    async fn verify(&self, token: &str) -> Result<VerifiedPrincipal, HealthError> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|err| {
            let reason = match err.kind() {
                ErrorKind::ExpiredSignature => "Token expired",
                ErrorKind::InvalidSignature => "Invalid signature",
                ErrorKind::InvalidToken => "Invalid token",
                _ => "Token validation failed",
            };
            HealthError::Auth(reason.into())
        })?;

        Ok(VerifiedPrincipal {
            id: data.claims.sub,
            role: data.claims.role,
        })
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` header value
pub fn bearer_token(header: Option<&str>) -> Option<&str> {
    let token = header?.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(role: Role) -> Principal {
        Principal {
            id: "p-1".into(),
            wallet_key: "0xabc".into(),
            role,
            email: None,
            created_at: "2025-01-01T00:00:00.000000Z".into(),
        }
    }

    #[tokio::test]
    async fn test_issue_and_verify() {
        let identity = JwtIdentity::new_dev();
        let token = identity.issue(&principal(Role::Researcher)).unwrap();

        let verified = identity.verify(&token).await.unwrap();
        assert_eq!(verified.id, "p-1");
        assert_eq!(verified.role, Role::Researcher);
    }

    #[tokio::test]
    async fn test_foreign_signature_rejected() {
        let issuer = JwtIdentity::new("a".repeat(40), 60).unwrap();
        let verifier = JwtIdentity::new("b".repeat(40), 60).unwrap();
        let token = issuer.issue(&principal(Role::Patient)).unwrap();

        assert!(matches!(verifier.verify(&token).await, Err(HealthError::Auth(_))));
        assert!(matches!(verifier.verify("not-a-jwt").await, Err(HealthError::Auth(_))));
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(matches!(JwtIdentity::new("short".into(), 60), Err(HealthError::Config(_))));
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token(Some("Bearer abc")), Some("abc"));
        assert_eq!(bearer_token(Some("Bearer ")), None);
        assert_eq!(bearer_token(Some("abc")), None);
        assert_eq!(bearer_token(None), None);
    }
}
