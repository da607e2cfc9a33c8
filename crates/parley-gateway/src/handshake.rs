use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::{Authorization, HeaderMapExt};
use chrono::{DateTime, Utc};
use jsonwebtoken::{DecodingKey, Validation, decode};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use parley_db::Database;
use parley_types::api::Claims;
use parley_types::models::Identity;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves a token subject to a known Identity.
pub trait IdentityDirectory: Send + Sync + 'static {
    fn find_identity(&self, subject: &str) -> anyhow::Result<Option<Identity>>;
}

/// Deactivated accounts resolve to nothing.
impl IdentityDirectory for Database {
    fn find_identity(&self, subject: &str) -> anyhow::Result<Option<Identity>> {
        let user = self.get_user_by_email(subject)?;
        Ok(user.filter(|u| u.active).map(|u| Identity::new(u.email)))
    }
}

/// Why an upgrade was refused. All of these answer 401.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credential in query or Authorization header")]
    MissingToken,

    #[error("invalid credential: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("unknown identity '{0}'")]
    UnknownIdentity(String),

    #[error("identity lookup failed: {0}")]
    Lookup(String),

    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
}

/// One live connection. The identity is fixed for the session's lifetime.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub identity: Identity,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(identity: Identity) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            created_at: Utc::now(),
        }
    }
}

/// Gate in front of the WebSocket upgrade. Runs once per connection.
#[derive(Clone)]
pub struct SessionAuthenticator {
    key: DecodingKey,
    validation: Validation,
    directory: Arc<dyn IdentityDirectory>,
    timeout: Duration,
}

impl SessionAuthenticator {
    pub fn new(secret: &str, directory: Arc<dyn IdentityDirectory>, timeout: Duration) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
            directory,
            timeout,
        }
    }

    /// Validate the upgrade request's credential and bind a new session to
    /// the identity it names. Token verification and the identity lookup
    /// together are bounded by the configured timeout.
    pub async fn authenticate(&self, headers: &HeaderMap, query_token: Option<&str>) -> Result<Session, AuthError> {
        let token = extract_token(headers, query_token).ok_or(AuthError::MissingToken)?;

        let result = tokio::time::timeout(self.timeout, self.resolve(token))
            .await
            .unwrap_or(Err(AuthError::Timeout(self.timeout)));

        if let Err(e) = &result {
            warn!("Gateway handshake rejected: {}", e);
        }
        result
    }

    async fn resolve(&self, token: String) -> Result<Session, AuthError> {
        let claims = decode::<Claims>(&token, &self.key, &self.validation)?.claims;

        let directory = self.directory.clone();
        let subject = claims.sub.clone();
        let identity = tokio::task::spawn_blocking(move || directory.find_identity(&subject))
            .await
            .map_err(|e| AuthError::Lookup(e.to_string()))?
            .map_err(|e| AuthError::Lookup(e.to_string()))?
            .ok_or(AuthError::UnknownIdentity(claims.sub))?;

        Ok(Session::new(identity))
    }
}

/// `?token=` wins over `Authorization: Bearer`; browsers cannot set headers
/// on a WebSocket upgrade.
pub fn extract_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(token) = query_token.filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }

    headers
        .typed_get::<Authorization<Bearer>>()
        .map(|auth| auth.token().to_string())
}
