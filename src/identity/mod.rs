//! Identity provider integration.
//!
//! `IdentityProvider` is the remote contract (GoTrue-compatible REST in
//! production, in-memory for local development and tests). `AuthClient`
//! layers session persistence on top of it, keeping the current session in
//! the caller's `ClientContext` the way a browser SDK keeps it in local
//! storage.

pub mod gotrue;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AuthError, StorageError};
use crate::local::ClientContext;
use crate::registration::model::{RegistrationMode, Role, TierLevel};

pub use gotrue::GoTrueClient;
pub use memory::InMemoryIdentityProvider;

/// A user record as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_confirmed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_metadata: serde_json::Value,
}

/// An active session. Tokens are redacted from `Debug` output.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    pub user: AuthUser,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"[redacted]")
            .field("refresh_token", &"[redacted]")
            .field("expires_in", &self.expires_in)
            .field("user", &self.user)
            .finish()
    }
}

/// Session as persisted in a client context.
pub type StoredSession = Session;

/// Metadata attached to a signup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignUpMetadata {
    pub role: Role,
    pub tier_level: TierLevel,
    pub registration_mode: RegistrationMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invite_code: Option<String>,
}

/// Result of a signup: a user, and a session only when the provider does not
/// require email confirmation.
#[derive(Debug, Clone)]
pub struct SignUpResponse {
    pub user: Option<AuthUser>,
    pub session: Option<Session>,
}

/// Remote identity provider operations.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Register credentials. `redirect_to` is where the confirmation email links back to.
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &SignUpMetadata,
        redirect_to: Option<&str>,
    ) -> Result<SignUpResponse, AuthError>;

    async fn sign_in_with_password(&self, email: &str, password: &str)
    -> Result<Session, AuthError>;

    /// Resolve the user behind an access token.
    async fn get_user(&self, access_token: &str) -> Result<AuthUser, AuthError>;

    /// Exchange a refresh token for a new session.
    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, AuthError>;

    async fn sign_out(&self, access_token: &str) -> Result<(), AuthError>;
}

/// Session-aware client over an `IdentityProvider`.
#[derive(Clone)]
pub struct AuthClient {
    provider: Arc<dyn IdentityProvider>,
}

impl AuthClient {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self { provider }
    }

    /// Sign up; a returned session is persisted in `context`.
    pub async fn sign_up(
        &self,
        context: &ClientContext,
        email: &str,
        password: &str,
        metadata: &SignUpMetadata,
        redirect_to: Option<&str>,
    ) -> Result<SignUpResponse, AuthError> {
        let response = self
            .provider
            .sign_up(email, password, metadata, redirect_to)
            .await?;
        if let Some(ref session) = response.session {
            persist(context, session).await?;
        }
        Ok(response)
    }

    /// Sign in and persist the session in `context`.
    pub async fn sign_in_with_password(
        &self,
        context: &ClientContext,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        let session = self.provider.sign_in_with_password(email, password).await?;
        persist(context, &session).await?;
        info!(user_id = %session.user.id, context = %context.id(), "Signed in");
        Ok(session)
    }

    /// The current session for `context`, verified with the provider.
    ///
    /// An expired access token is refreshed once; if that fails too, the
    /// stored session is dropped and `None` is returned.
    pub async fn get_session(&self, context: &ClientContext) -> Result<Option<Session>, AuthError> {
        let slot = context.auth_session();
        let stored = match slot.get().await {
            Ok(stored) => stored,
            Err(StorageError::Corrupt { .. }) => {
                warn!(context = %context.id(), "Dropping unreadable stored session");
                slot.remove().await.map_err(storage_err)?;
                None
            }
            Err(e) => return Err(storage_err(e)),
        };
        let Some(stored) = stored else {
            return Ok(None);
        };

        match self.provider.get_user(&stored.access_token).await {
            Ok(user) => {
                let session = Session { user, ..stored };
                Ok(Some(session))
            }
            Err(AuthError::Rejected { .. }) => {
                debug!(context = %context.id(), "Access token rejected; refreshing session");
                match self.provider.refresh_session(&stored.refresh_token).await {
                    Ok(session) => {
                        persist(context, &session).await?;
                        Ok(Some(session))
                    }
                    Err(AuthError::Rejected { .. }) => {
                        slot.remove().await.map_err(storage_err)?;
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Adopt an access/refresh token pair (e.g. from an emailed link).
    pub async fn set_session(
        &self,
        context: &ClientContext,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<Session, AuthError> {
        let session = match self.provider.get_user(access_token).await {
            Ok(user) => Session {
                access_token: access_token.to_string(),
                refresh_token: refresh_token.to_string(),
                expires_in: None,
                user,
            },
            Err(AuthError::Rejected { .. }) => self.provider.refresh_session(refresh_token).await?,
            Err(e) => return Err(e),
        };
        persist(context, &session).await?;
        info!(user_id = %session.user.id, context = %context.id(), "Session established from tokens");
        Ok(session)
    }

    /// Sign out remotely (best effort) and forget the stored session.
    pub async fn sign_out(&self, context: &ClientContext) -> Result<(), AuthError> {
        let slot = context.auth_session();
        if let Ok(Some(stored)) = slot.get().await {
            if let Err(e) = self.provider.sign_out(&stored.access_token).await {
                warn!(context = %context.id(), error = %e, "Remote sign-out failed");
            }
        }
        slot.remove().await.map_err(storage_err)?;
        Ok(())
    }

    pub async fn get_user(&self, access_token: &str) -> Result<AuthUser, AuthError> {
        self.provider.get_user(access_token).await
    }
}

async fn persist(context: &ClientContext, session: &Session) -> Result<(), AuthError> {
    context
        .auth_session()
        .set(session)
        .await
        .map_err(storage_err)
}

fn storage_err(e: StorageError) -> AuthError {
    AuthError::Transport(format!("session storage: {e}"))
}
