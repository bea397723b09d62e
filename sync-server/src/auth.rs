//! Caller authentication.
//!
//! Every request carries an opaque credential. The session layer trades it
//! for a [`UserId`] before anything reaches the orchestrator; a rejected
//! credential ends the call with `Unauthenticated`.

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use sync_types::UserId;

/// Credential verification errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No credential was supplied.
    #[error("missing credential")]
    Missing,

    /// The token failed signature, expiry or issuer checks.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// The token verified but names no user.
    #[error("token subject is missing")]
    MissingSubject,
}

/// Turns a caller credential into a user identity.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verify `credential` and return the user it belongs to.
    async fn authenticate(&self, credential: &str) -> Result<UserId, AuthError>;
}

#[derive(Deserialize)]
struct Claims {
    sub: String,
}

/// HS256 JWT verifier with a shared secret.
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    /// Verify tokens signed with `secret`, optionally pinning the issuer.
    pub fn new(secret: &str, issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl std::fmt::Debug for JwtAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtAuthenticator")
            .field("key", &"[REDACTED]")
            .field("issuer", &self.validation.iss)
            .finish()
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<UserId, AuthError> {
        let token = credential.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }

        let decoded = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|error| AuthError::InvalidToken(sanitize(&error)))?;

        let user = UserId::new(decoded.claims.sub);
        if user.is_blank() {
            return Err(AuthError::MissingSubject);
        }
        Ok(user)
    }
}

fn sanitize(error: &impl std::fmt::Display) -> String {
    error.to_string().replace('\n', " ").trim().to_string()
}
