//! Bearer token verification: token in, subject (user id) out.

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Returns the subject id, or `Unauthorized`.
    async fn verify(&self, token: &str) -> AppResult<String>;
}

/// RS256 verification against the identity service's public key.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn from_rsa_pem(public_key_pem: &str) -> AppResult<Self> {
        let key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
            .map_err(|e| AppError::Config(format!("invalid JWT public key: {e}")))?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 30;
        Ok(Self { key, validation })
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> AppResult<String> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            debug!(error = %e, "JWT rejected");
            AppError::Unauthorized
        })?;
        if data.claims.sub.trim().is_empty() {
            return Err(AppError::Unauthorized);
        }
        Ok(data.claims.sub)
    }
}

/// Fixed token table for tests and local development.
#[derive(Default, Clone)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, String>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, subject: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), subject.into());
        self
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> AppResult<String> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AppError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_garbage_public_key() {
        assert!(matches!(
            JwtVerifier::from_rsa_pem("not a pem"),
            Err(AppError::Config(_))
        ));
    }

    #[tokio::test]
    async fn static_verifier_maps_known_tokens() {
        let verifier = StaticTokenVerifier::new().with_token("t1", "alice");
        assert_eq!(verifier.verify("t1").await.unwrap(), "alice");
        assert!(matches!(verifier.verify("t2").await, Err(AppError::Unauthorized)));
    }
}
