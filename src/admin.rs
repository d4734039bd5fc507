//! Admin area: server-verified access gate and invite management.
//!
//! Access is decided per request by resolving the bearer token with the
//! identity provider and checking the user's email against the configured
//! allow-list. Nothing the client stores can grant access.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{AuthError, InviteError};
use crate::identity::{AuthClient, AuthUser};
use crate::registration::InviteIssuer;
use crate::registration::model::{InviteCode, InviteRole, TierLevel};
use crate::store::Database;

/// Upper bound on invites returned by one listing.
pub const MAX_INVITE_LIST: usize = 200;

/// Checks that a bearer token belongs to an administrator.
#[derive(Clone)]
pub struct AdminGate {
    auth: AuthClient,
    admin_emails: Arc<Vec<String>>,
}

impl AdminGate {
    pub fn new(auth: AuthClient, admin_emails: &[String]) -> Self {
        let admin_emails = admin_emails
            .iter()
            .map(|e| e.trim().to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        Self {
            auth,
            admin_emails: Arc::new(admin_emails),
        }
    }

    pub fn is_admin_email(&self, email: &str) -> bool {
        let email = email.trim().to_ascii_lowercase();
        self.admin_emails.iter().any(|e| *e == email)
    }

    /// Resolve `access_token` and require an allow-listed, confirmed email.
    pub async fn verify(&self, access_token: &str) -> Result<AuthUser, AuthError> {
        let user = self.auth.get_user(access_token).await?;
        let Some(email) = user.email.as_deref() else {
            return Err(AuthError::Forbidden("account has no email".to_string()));
        };
        if user.email_confirmed_at.is_none() {
            warn!(user_id = %user.id, "Admin access attempted with unconfirmed email");
            return Err(AuthError::Forbidden("email not confirmed".to_string()));
        }
        if !self.is_admin_email(email) {
            warn!(user_id = %user.id, "Admin access denied");
            return Err(AuthError::Forbidden("not an administrator".to_string()));
        }
        Ok(user)
    }
}

/// Admin request to create an invite. Without `code`, one is generated.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateInviteRequest {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(alias = "code_type")]
    pub role_type: InviteRole,
    #[serde(default)]
    pub tier_level: TierLevel,
}

/// Invite management on behalf of a verified administrator.
#[derive(Clone)]
pub struct InviteAdmin {
    issuer: InviteIssuer,
    db: Arc<dyn Database>,
}

impl InviteAdmin {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            issuer: InviteIssuer::new(Arc::clone(&db)),
            db,
        }
    }

    pub async fn create(
        &self,
        admin: &AuthUser,
        request: CreateInviteRequest,
    ) -> Result<InviteCode, InviteError> {
        let invite = match request.code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => {
                self.issuer
                    .create_custom(code, request.role_type, request.tier_level, Some(admin.id))
                    .await?
            }
            _ => {
                self.issuer
                    .generate(request.role_type, request.tier_level, Some(admin.id))
                    .await?
            }
        };
        info!(admin_id = %admin.id, code = %invite.code, "Admin created invite");
        Ok(invite)
    }

    pub async fn list(&self, limit: Option<usize>) -> Result<Vec<InviteCode>, InviteError> {
        let limit = limit.unwrap_or(MAX_INVITE_LIST).clamp(1, MAX_INVITE_LIST);
        Ok(self.db.list_invites(limit).await?)
    }
}
