//! Authentication policies for incoming sessions.
//!
//! A policy sees the raw credential of the handshake (the `Connect` frame
//! body, or the `token` query parameter of the websocket upgrade) and either
//! returns the caller's [`Identity`] or refuses. Refusal is terminal for that
//! connection attempt.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde_json::{Map, Value};

use crate::error::ErrorCode;

/// Who the peer is, as established by an [`AuthPolicy`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Identity {
    /// Subject (`sub` claim for JWTs).
    pub subject: Option<String>,
    /// Remaining verified claims. Empty for non-token policies.
    pub claims: Map<String, Value>,
}

impl Identity {
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn subject(subject: impl Into<String>) -> Self {
        Self { subject: Some(subject.into()), claims: Map::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing credentials")]
    Missing,
    #[error("invalid credentials")]
    Invalid,
    #[error("invalid token: {0}")]
    Token(String),
}

impl ErrorCode for AuthError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Missing => "E_AUTH_MISSING",
            Self::Invalid => "E_AUTH_INVALID",
            Self::Token(_) => "E_AUTH_TOKEN",
        }
    }
}

/// Pluggable predicate over handshake credentials.
pub trait AuthPolicy: Send + Sync + 'static {
    /// # Errors
    ///
    /// Returns [`AuthError`] when the credential is refused.
    fn authenticate(&self, credentials: &str) -> Result<Identity, AuthError>;
}

impl<F> AuthPolicy for F
where
    F: Fn(&str) -> Result<Identity, AuthError> + Send + Sync + 'static,
{
    fn authenticate(&self, credentials: &str) -> Result<Identity, AuthError> {
        self(credentials)
    }
}

// =============================================================================
// POLICIES
// =============================================================================

/// Accepts every peer, with or without credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AuthPolicy for AllowAll {
    fn authenticate(&self, _credentials: &str) -> Result<Identity, AuthError> {
        Ok(Identity::anonymous())
    }
}

/// Accepts exactly one shared token.
#[derive(Debug, Clone)]
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

impl AuthPolicy for StaticToken {
    fn authenticate(&self, credentials: &str) -> Result<Identity, AuthError> {
        if credentials.is_empty() {
            return Err(AuthError::Missing);
        }
        if credentials != self.token {
            return Err(AuthError::Invalid);
        }
        Ok(Identity::anonymous())
    }
}

/// Accepts HS256-signed JWTs. `exp` and `nbf` are enforced when present.
pub struct JwtPolicy {
    key: DecodingKey,
    validation: Validation,
}

impl JwtPolicy {
    #[must_use]
    pub fn hs256(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        Self { key: DecodingKey::from_secret(secret), validation }
    }
}

impl AuthPolicy for JwtPolicy {
    fn authenticate(&self, credentials: &str) -> Result<Identity, AuthError> {
        if credentials.is_empty() {
            return Err(AuthError::Missing);
        }
        let data = decode::<Map<String, Value>>(credentials, &self.key, &self.validation)
            .map_err(|e| AuthError::Token(e.to_string()))?;

        let mut claims = data.claims;
        let subject = match claims.remove("sub") {
            Some(Value::String(sub)) => Some(sub),
            _ => None,
        };
        Ok(Identity { subject, claims })
    }
}

impl std::fmt::Debug for JwtPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtPolicy")
            .field("algorithms", &self.validation.algorithms)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
