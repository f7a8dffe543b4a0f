//! Gateway authentication: JWT (HS256) and injected session validation.

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried by a platform JWT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Session id, when the token is session-bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Expiry (seconds since epoch).
    pub exp: u64,
}

/// Identity established by a successful authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    /// User id.
    pub user_id: String,
    /// Session id, when known.
    pub session_id: Option<String>,
}

/// Verifies HS256 tokens against the configured secret.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Creates a verifier for the given shared secret.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Verifies a token, returning the authenticated identity.
    ///
    /// # Errors
    ///
    /// Returns the decode error for expired, malformed, or wrongly
    /// signed tokens.
    pub fn verify(&self, token: &str) -> Result<AuthenticatedUser, jsonwebtoken::errors::Error> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)?;
        Ok(AuthenticatedUser {
            user_id: data.claims.sub,
            session_id: data.claims.session_id,
        })
    }
}

/// Validates opaque session ids. The platform injects its own
/// implementation; tests inject a fixed table.
pub trait SessionValidator: Send + Sync {
    /// Returns the identity bound to `session_id`, if the session is
    /// live.
    fn validate(&self, session_id: &str) -> Option<AuthenticatedUser>;
}

/// Rejects every session. The default when no validator is injected.
pub struct NoSessions;

impl SessionValidator for NoSessions {
    fn validate(&self, _session_id: &str) -> Option<AuthenticatedUser> {
        None
    }
}

/// Fixed session table, for tests and single-node deployments.
#[derive(Default)]
pub struct StaticSessionValidator {
    sessions: std::collections::HashMap<String, String>,
}

impl StaticSessionValidator {
    /// Creates a validator over `(session_id, user_id)` pairs.
    #[must_use]
    pub fn new(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            sessions: pairs.into_iter().collect(),
        }
    }
}

impl SessionValidator for StaticSessionValidator {
    fn validate(&self, session_id: &str) -> Option<AuthenticatedUser> {
        self.sessions.get(session_id).map(|user_id| AuthenticatedUser {
            user_id: user_id.clone(),
            session_id: Some(session_id.to_string()),
        })
    }
}

/// Issues a token for tests.
///
/// # Errors
///
/// Returns the encode error when signing fails.
pub fn issue_token(
    secret: &str,
    user_id: &str,
    session_id: Option<&str>,
    ttl_secs: u64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let claims = Claims {
        sub: user_id.to_string(),
        session_id: session_id.map(ToString::to_string),
        exp: now + ttl_secs,
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
}
