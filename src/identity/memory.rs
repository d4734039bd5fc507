//! In-process identity provider for local development and tests.
//!
//! Mirrors the hosted provider's observable behavior: signups require email
//! confirmation by default, and the "email" is a confirmation link carrying
//! an access/refresh token pair that only becomes usable once followed.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use super::{AuthUser, IdentityProvider, Session, SignUpMetadata, SignUpResponse};
use crate::error::AuthError;

/// Session lifetime reported to callers, in seconds.
const SESSION_TTL_SECS: i64 = 3600;

/// Shortest password the provider itself accepts.
const PROVIDER_MIN_PASSWORD_LEN: usize = 6;

struct UserRecord {
    user: AuthUser,
    password: String,
}

/// Tokens minted at signup, delivered by the confirmation email.
struct PendingConfirmation {
    access_token: String,
    refresh_token: String,
    link: Option<String>,
}

#[derive(Default)]
struct State {
    require_confirmation: bool,
    users: HashMap<String, UserRecord>,
    access_tokens: HashMap<String, Uuid>,
    refresh_tokens: HashMap<String, Uuid>,
    confirmations: HashMap<String, PendingConfirmation>,
}

/// Identity provider that keeps everything in memory.
pub struct InMemoryIdentityProvider {
    state: Mutex<State>,
}

impl Default for InMemoryIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryIdentityProvider {
    /// A provider that requires email confirmation, like the hosted default.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                require_confirmation: true,
                ..State::default()
            }),
        }
    }

    pub fn set_require_confirmation(&self, required: bool) {
        self.state().require_confirmation = required;
    }

    /// Token pair carried by the confirmation link sent to `email`.
    pub fn confirmation_tokens(&self, email: &str) -> Option<(String, String)> {
        let state = self.state();
        state
            .confirmations
            .get(&normalize_email(email))
            .map(|c| (c.access_token.clone(), c.refresh_token.clone()))
    }

    /// Full confirmation link sent to `email`, if signup supplied a redirect.
    pub fn confirmation_link(&self, email: &str) -> Option<String> {
        let state = self.state();
        state
            .confirmations
            .get(&normalize_email(email))
            .and_then(|c| c.link.clone())
    }

    /// Invalidate an access token, as if it had expired.
    pub fn revoke_access_token(&self, access_token: &str) {
        self.state().access_tokens.remove(access_token);
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn rejected(status: u16, message: &str) -> AuthError {
    AuthError::Rejected {
        status,
        message: message.to_string(),
    }
}

fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}

impl State {
    fn issue_session(&mut self, user: &AuthUser) -> Session {
        let access_token = new_token();
        let refresh_token = new_token();
        self.access_tokens.insert(access_token.clone(), user.id);
        self.refresh_tokens.insert(refresh_token.clone(), user.id);
        Session {
            access_token,
            refresh_token,
            expires_in: Some(SESSION_TTL_SECS),
            user: user.clone(),
        }
    }

    fn user_by_id(&self, id: Uuid) -> Option<&UserRecord> {
        self.users.values().find(|r| r.user.id == id)
    }

    /// Following a confirmation link confirms the user and activates its tokens.
    fn redeem_confirmation(&mut self, token: &str, is_refresh: bool) -> Option<AuthUser> {
        let email = self
            .confirmations
            .iter()
            .find(|(_, c)| {
                if is_refresh {
                    c.refresh_token == token
                } else {
                    c.access_token == token
                }
            })
            .map(|(email, _)| email.clone())?;
        let confirmation = self.confirmations.remove(&email)?;
        let record = self.users.get_mut(&email)?;
        record.user.email_confirmed_at = Some(Utc::now());
        let user = record.user.clone();
        self.access_tokens
            .insert(confirmation.access_token, user.id);
        self.refresh_tokens
            .insert(confirmation.refresh_token, user.id);
        info!(user_id = %user.id, "Email confirmed");
        Some(user)
    }
}

#[async_trait]
impl IdentityProvider for InMemoryIdentityProvider {
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &SignUpMetadata,
        redirect_to: Option<&str>,
    ) -> Result<SignUpResponse, AuthError> {
        let mut state = self.state();
        let key = normalize_email(email);
        if state.users.contains_key(&key) {
            return Err(rejected(422, "User already registered"));
        }
        if password.chars().count() < PROVIDER_MIN_PASSWORD_LEN {
            return Err(rejected(422, "Password should be at least 6 characters"));
        }

        let user_metadata = serde_json::to_value(metadata)
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
        let user = AuthUser {
            id: Uuid::new_v4(),
            email: Some(key.clone()),
            email_confirmed_at: None,
            user_metadata,
        };
        state.users.insert(
            key.clone(),
            UserRecord {
                user: user.clone(),
                password: password.to_string(),
            },
        );

        if !state.require_confirmation {
            let mut confirmed = user;
            confirmed.email_confirmed_at = Some(Utc::now());
            if let Some(record) = state.users.get_mut(&key) {
                record.user = confirmed.clone();
            }
            let session = state.issue_session(&confirmed);
            return Ok(SignUpResponse {
                user: Some(confirmed),
                session: Some(session),
            });
        }

        let access_token = new_token();
        let refresh_token = new_token();
        let link = redirect_to.map(|base| {
            let sep = if base.contains('?') { '&' } else { '?' };
            format!("{base}{sep}access_token={access_token}&refresh_token={refresh_token}")
        });
        if let Some(ref link) = link {
            info!(email = %key, link = %link, "Confirmation email (not sent; in-memory provider)");
        }
        state.confirmations.insert(
            key,
            PendingConfirmation {
                access_token,
                refresh_token,
                link,
            },
        );

        Ok(SignUpResponse {
            user: Some(user),
            session: None,
        })
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        let mut state = self.state();
        let user = match state.users.get(&normalize_email(email)) {
            Some(record) if record.password == password => record.user.clone(),
            _ => return Err(rejected(400, "Invalid login credentials")),
        };
        if user.email_confirmed_at.is_none() {
            return Err(rejected(400, "Email not confirmed"));
        }
        Ok(state.issue_session(&user))
    }

    async fn get_user(&self, access_token: &str) -> Result<AuthUser, AuthError> {
        let mut state = self.state();
        if let Some(id) = state.access_tokens.get(access_token).copied() {
            return state
                .user_by_id(id)
                .map(|r| r.user.clone())
                .ok_or_else(|| rejected(401, "User not found"));
        }
        state
            .redeem_confirmation(access_token, false)
            .ok_or_else(|| rejected(401, "Invalid JWT"))
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, AuthError> {
        let mut state = self.state();
        let user = match state.refresh_tokens.remove(refresh_token) {
            Some(id) => state
                .user_by_id(id)
                .map(|r| r.user.clone())
                .ok_or_else(|| rejected(400, "User not found"))?,
            None => {
                let user = state
                    .redeem_confirmation(refresh_token, true)
                    .ok_or_else(|| rejected(400, "Invalid Refresh Token"))?;
                state.refresh_tokens.remove(refresh_token);
                user
            }
        };
        Ok(state.issue_session(&user))
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), AuthError> {
        let mut state = self.state();
        if let Some(id) = state.access_tokens.remove(access_token) {
            state.refresh_tokens.retain(|_, uid| *uid != id);
        }
        Ok(())
    }
}
