//! GoTrue-compatible REST client (the hosted auth service's API).

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use super::{AuthUser, IdentityProvider, Session, SignUpMetadata, SignUpResponse};
use crate::error::AuthError;

/// Client for a GoTrue-style auth endpoint, e.g. `https://<project>.supabase.co/auth/v1`.
pub struct GoTrueClient {
    base_url: String,
    anon_key: SecretString,
    client: reqwest::Client,
}

/// Body returned by the token and (auto-confirmed) signup endpoints.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    user: AuthUser,
}

impl From<TokenResponse> for Session {
    fn from(t: TokenResponse) -> Self {
        Session {
            access_token: t.access_token,
            refresh_token: t.refresh_token,
            expires_in: t.expires_in,
            user: t.user,
        }
    }
}

impl GoTrueClient {
    pub fn new(base_url: impl Into<String>, anon_key: SecretString) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            anon_key,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn with_key(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header("apikey", self.anon_key.expose_secret())
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, AuthError> {
        let resp = self
            .with_key(builder)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(AuthError::Rejected {
            status,
            message: error_message(&body),
        })
    }

    async fn token_grant(
        &self,
        grant_type: &str,
        body: serde_json::Value,
    ) -> Result<Session, AuthError> {
        let resp = self
            .send(
                self.client
                    .post(self.url("token"))
                    .query(&[("grant_type", grant_type)])
                    .json(&body),
            )
            .await?;
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
        Ok(token.into())
    }
}

/// Pull the human-readable message out of an error body.
///
/// GoTrue has used `msg`, `message`, `error_description` and `error` over
/// time; the first present wins, else the raw body.
fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["msg", "message", "error_description", "error"] {
            if let Some(msg) = value.get(key).and_then(|v| v.as_str()) {
                return msg.to_string();
            }
        }
    }
    if body.trim().is_empty() {
        "Authentication request failed".to_string()
    } else {
        body.trim().to_string()
    }
}

/// Signup returns a session when auto-confirm is on, a bare user otherwise.
fn parse_signup(value: serde_json::Value) -> Result<SignUpResponse, AuthError> {
    if value.get("access_token").is_some() {
        let token: TokenResponse = serde_json::from_value(value)
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
        let session: Session = token.into();
        return Ok(SignUpResponse {
            user: Some(session.user.clone()),
            session: Some(session),
        });
    }
    let user_value = value.get("user").cloned().unwrap_or(value);
    if user_value.get("id").is_none() {
        return Ok(SignUpResponse {
            user: None,
            session: None,
        });
    }
    let user: AuthUser = serde_json::from_value(user_value)
        .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
    Ok(SignUpResponse {
        user: Some(user),
        session: None,
    })
}

#[async_trait]
impl IdentityProvider for GoTrueClient {
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &SignUpMetadata,
        redirect_to: Option<&str>,
    ) -> Result<SignUpResponse, AuthError> {
        let mut request = self.client.post(self.url("signup")).json(&serde_json::json!({
            "email": email,
            "password": password,
            "data": metadata,
        }));
        if let Some(redirect) = redirect_to {
            request = request.query(&[("redirect_to", redirect)]);
        }
        let resp = self.send(request).await?;
        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
        debug!(has_session = value.get("access_token").is_some(), "Signup response received");
        parse_signup(value)
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        self.token_grant(
            "password",
            serde_json::json!({ "email": email, "password": password }),
        )
        .await
    }

    async fn get_user(&self, access_token: &str) -> Result<AuthUser, AuthError> {
        let resp = self
            .send(self.client.get(self.url("user")).bearer_auth(access_token))
            .await?;
        resp.json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, AuthError> {
        self.token_grant(
            "refresh_token",
            serde_json::json!({ "refresh_token": refresh_token }),
        )
        .await
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), AuthError> {
        self.send(self.client.post(self.url("logout")).bearer_auth(access_token))
            .await?;
        Ok(())
    }
}
