//! Invite codes: validation at registration time and issuance by administrators.

use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{InviteCode, InviteRole, TierLevel};
use super::validation::{MIN_INVITE_CODE_LEN, is_plausible_code, normalize_code};
use crate::error::InviteError;
use crate::store::Database;

/// How many random candidates `generate` tries before giving up.
pub const MAX_GENERATION_ATTEMPTS: u32 = 10;

/// Result of checking a candidate code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InviteCheck {
    pub is_valid: bool,
    pub data: Option<InviteCode>,
}

impl InviteCheck {
    pub fn invalid() -> Self {
        Self {
            is_valid: false,
            data: None,
        }
    }

    fn valid(invite: InviteCode) -> Self {
        Self {
            is_valid: true,
            data: Some(invite),
        }
    }
}

/// Read-only check of a candidate code against the store.
#[derive(Clone)]
pub struct InviteValidator {
    db: Arc<dyn Database>,
}

impl InviteValidator {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Look up an available invite matching `candidate`.
    ///
    /// Codes shorter than the minimum are rejected without a query. Store
    /// failures are reported as an invalid code.
    pub async fn validate(&self, candidate: &str) -> InviteCheck {
        let code = normalize_code(candidate);
        if !is_plausible_code(&code) {
            return InviteCheck::invalid();
        }

        match self.db.get_available_invite(&code).await {
            Ok(Some(invite)) => {
                debug!(code = %invite.code, role = %invite.role_type, tier = %invite.tier_level, "Invite code valid");
                InviteCheck::valid(invite)
            }
            Ok(None) => {
                debug!(code = %code, "Invite code not available");
                InviteCheck::invalid()
            }
            Err(e) => {
                warn!(code = %code, error = %e, "Invite lookup failed; treating code as invalid");
                InviteCheck::invalid()
            }
        }
    }
}

/// Creates invite codes on behalf of an administrator.
#[derive(Clone)]
pub struct InviteIssuer {
    db: Arc<dyn Database>,
}

impl InviteIssuer {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Insert a code chosen by the administrator.
    pub async fn create_custom(
        &self,
        raw_code: &str,
        role: InviteRole,
        tier: TierLevel,
        created_by: Option<Uuid>,
    ) -> Result<InviteCode, InviteError> {
        let code = normalize_code(raw_code);
        check_custom_code(&code)?;
        self.insert(code, role, tier, created_by).await
    }

    /// Insert a random `<PREFIX><4 digits>` code, retrying on collisions.
    pub async fn generate(
        &self,
        role: InviteRole,
        tier: TierLevel,
        created_by: Option<Uuid>,
    ) -> Result<InviteCode, InviteError> {
        for attempt in 1..=MAX_GENERATION_ATTEMPTS {
            let code = random_code(role);
            match self.insert(code, role, tier, created_by).await {
                Ok(invite) => return Ok(invite),
                Err(InviteError::AlreadyExists) => {
                    debug!(attempt, role = %role, "Generated invite code collided; retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(InviteError::GenerationExhausted {
            attempts: MAX_GENERATION_ATTEMPTS,
        })
    }

    async fn insert(
        &self,
        code: String,
        role: InviteRole,
        tier: TierLevel,
        created_by: Option<Uuid>,
    ) -> Result<InviteCode, InviteError> {
        let mut invite = InviteCode::new(code, role, tier);
        if let Some(admin) = created_by {
            invite = invite.with_created_by(admin);
        }
        self.db.insert_invite(&invite).await?;
        info!(code = %invite.code, role = %role, tier = %tier, "Invite code created");
        Ok(invite)
    }
}

fn check_custom_code(code: &str) -> Result<(), InviteError> {
    if !is_plausible_code(code) {
        return Err(InviteError::Malformed(format!(
            "code must be at least {MIN_INVITE_CODE_LEN} characters"
        )));
    }
    if !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(InviteError::Malformed(
            "code may only contain letters and digits".to_string(),
        ));
    }
    Ok(())
}

fn random_code(role: InviteRole) -> String {
    let digits: u16 = rand::thread_rng().gen_range(0..10_000);
    format!("{}{digits:04}", role.code_prefix())
}
