//! Finalizing a registration once a session exists.
//!
//! Shared by the inline signup path, the sign-in flow and the confirmation
//! callback. Every step reports a typed result instead of aborting, so the
//! caller decides what a partial failure means.
//!
//! Role and tier never come from client-held data alone. Public
//! registrations get the selected role at the base tier; invite
//! registrations get what the stored invite row grants, and only once this
//! user has redeemed it.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{PendingRegistration, ProfileSetupStage, RegistrationMode, Role, TierLevel};
use super::profile::ProfileMaterializer;
use crate::error::StorageError;
use crate::identity::{Session, SignUpMetadata};
use crate::local::ClientContext;
use crate::store::Database;

/// What happened to the profile row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ProfileResult {
    Created,
    /// A profile for this user already existed; setup proceeds with it.
    AlreadyExisted,
    Failed(String),
}

/// What happened to the invite code.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum InviteResult {
    /// Public registration, or no code recorded.
    NotApplicable,
    Consumed,
    /// This user had already redeemed the code.
    AlreadyUsed,
    /// Redeemed by another account, or removed. The profile falls back to
    /// public defaults.
    ClaimedByOther,
    /// The code grants no profile role.
    Ineligible,
    Failed(String),
}

/// Outcome of one finalization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalizeOutcome {
    pub user_id: Uuid,
    pub profile: ProfileResult,
    pub invite: InviteResult,
    /// Whether the pending registration slot was cleared by this run.
    pub cleared_pending: bool,
    /// Data staged for profile setup, present only when the pending slot was cleared.
    pub stage: Option<ProfileSetupStage>,
}

impl FinalizeOutcome {
    /// Whether any step failed.
    pub fn has_failures(&self) -> bool {
        matches!(self.profile, ProfileResult::Failed(_))
            || matches!(self.invite, InviteResult::Failed(_))
    }
}

/// Role and tier a registration is entitled to, with the invite step's result.
#[derive(Debug)]
struct Grant {
    role: Role,
    tier_level: TierLevel,
    invite: InviteResult,
}

impl Grant {
    fn public(role: Role) -> Self {
        Self {
            role,
            tier_level: TierLevel::default(),
            invite: InviteResult::NotApplicable,
        }
    }

    fn fallback(invite: InviteResult) -> Self {
        Self {
            role: Role::default(),
            tier_level: TierLevel::default(),
            invite,
        }
    }
}

/// Creates the profile, consumes the invite and moves the context from
/// "pending registration" to "profile setup".
#[derive(Clone)]
pub struct Finalizer {
    db: Arc<dyn Database>,
    profiles: ProfileMaterializer,
}

impl Finalizer {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            profiles: ProfileMaterializer::new(Arc::clone(&db)),
            db,
        }
    }

    /// Finalize the registration staged in `context`, if it belongs to the
    /// session's user. Returns `None` when nothing applicable is staged.
    pub async fn finalize_pending(
        &self,
        context: &ClientContext,
        session: &Session,
    ) -> Result<Option<FinalizeOutcome>, StorageError> {
        let store = context.pending_registrations();
        let Some(staged) = store.peek().await? else {
            return Ok(None);
        };

        let email = session.user.email.as_deref().unwrap_or_default();
        if !staged.registration.belongs_to(email) {
            warn!(
                context = %context.id(),
                user_id = %session.user.id,
                generation = staged.generation,
                "Pending registration is for a different account; leaving it staged"
            );
            return Ok(None);
        }

        self.finalize(
            context,
            session.user.id,
            &staged.registration,
            Some(staged.generation),
        )
        .await
        .map(Some)
    }

    /// Finalize `registration` for `user_id`.
    ///
    /// With `generation`, the pending slot is cleared only if it still holds
    /// that generation. Without one (signup returned a session directly), any
    /// leftover pending registration in the context is discarded.
    pub async fn finalize(
        &self,
        context: &ClientContext,
        user_id: Uuid,
        registration: &PendingRegistration,
        generation: Option<u64>,
    ) -> Result<FinalizeOutcome, StorageError> {
        let grant = self.grant(user_id, registration).await;
        let profile = self.create_profile(user_id, &grant).await;

        let store = context.pending_registrations();
        let cleared_pending = match generation {
            Some(generation) => store.clear_if_current(generation).await?,
            None => {
                if let Some(stale) = store.take().await? {
                    warn!(context = %context.id(), email = %stale.email, "Discarding stale pending registration");
                }
                true
            }
        };

        let stage = if cleared_pending {
            let stage = registration.setup_stage(grant.role, grant.tier_level);
            context.setup_stage().set(&stage).await?;
            Some(stage)
        } else {
            None
        };

        let outcome = FinalizeOutcome {
            user_id,
            profile,
            invite: grant.invite,
            cleared_pending,
            stage,
        };
        if outcome.has_failures() {
            warn!(user_id = %user_id, outcome = ?outcome, "Registration finalized with failures");
        } else {
            info!(
                user_id = %user_id,
                mode = %registration.registration_mode,
                role = %grant.role,
                tier = grant.tier_level.get(),
                "Registration finalized"
            );
        }
        Ok(outcome)
    }

    /// Recover a registration whose pending entry lives in another browser
    /// context, using the metadata recorded at signup.
    ///
    /// Only acts when the user has no profile yet. The metadata is user
    /// controlled, so it picks the mode, public role and invite code but
    /// never the tier. The pending slot of `context` is left alone; setup
    /// data is staged only if that slot is empty.
    pub async fn recover_from_metadata(
        &self,
        context: &ClientContext,
        session: &Session,
    ) -> Result<Option<FinalizeOutcome>, StorageError> {
        let user_id = session.user.id;
        match self.profiles.get(user_id).await {
            Ok(None) => {}
            Ok(Some(_)) => return Ok(None),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Profile lookup failed; skipping recovery");
                return Ok(None);
            }
        }
        let Ok(metadata) =
            serde_json::from_value::<SignUpMetadata>(session.user.user_metadata.clone())
        else {
            debug!(user_id = %user_id, "No usable signup metadata to recover from");
            return Ok(None);
        };

        let registration = PendingRegistration {
            role: metadata.role,
            tier_level: metadata.tier_level,
            email: session.user.email.clone().unwrap_or_default(),
            registration_mode: metadata.registration_mode,
            invite_code: metadata.invite_code,
            invite_data: None,
        };
        let grant = self.grant(user_id, &registration).await;
        let profile = self.create_profile(user_id, &grant).await;

        let stage = if context.pending_registrations().peek().await?.is_none() {
            let stage = registration.setup_stage(grant.role, grant.tier_level);
            context.setup_stage().set(&stage).await?;
            Some(stage)
        } else {
            None
        };

        info!(
            user_id = %user_id,
            profile = ?profile,
            invite = ?grant.invite,
            tier = grant.tier_level.get(),
            "Registration recovered from signup metadata"
        );
        Ok(Some(FinalizeOutcome {
            user_id,
            profile,
            invite: grant.invite,
            cleared_pending: false,
            stage,
        }))
    }

    /// Work out the role and tier for `registration`, redeeming its invite
    /// code first when there is one.
    ///
    /// Invite role and tier are read from the stored row and only granted
    /// when this user holds the redemption. Anything else falls back to
    /// public defaults.
    async fn grant(&self, user_id: Uuid, registration: &PendingRegistration) -> Grant {
        if registration.registration_mode != RegistrationMode::Invite {
            return Grant::public(registration.role);
        }
        let Some(code) = registration.invite_code.as_deref() else {
            warn!(user_id = %user_id, "Invite registration without a code; using public defaults");
            return Grant::fallback(InviteResult::NotApplicable);
        };

        let invite = match self.db.get_invite(code).await {
            Ok(Some(invite)) => invite,
            Ok(None) => {
                warn!(code, user_id = %user_id, "Invite code no longer exists");
                return Grant::fallback(InviteResult::ClaimedByOther);
            }
            Err(e) => {
                warn!(code, user_id = %user_id, error = %e, "Invite lookup failed");
                return Grant::fallback(InviteResult::Failed(e.to_string()));
            }
        };
        let Some(role) = invite.role_type.profile_role() else {
            warn!(code, user_id = %user_id, role = %invite.role_type, "Invite grants no profile role");
            return Grant::fallback(InviteResult::Ineligible);
        };
        let granted = |invite_result| Grant {
            role,
            tier_level: invite.tier_level,
            invite: invite_result,
        };

        if invite.used_by == Some(user_id) {
            debug!(code, user_id = %user_id, "Invite already redeemed by this user");
            return granted(InviteResult::AlreadyUsed);
        }
        if !invite.is_available() {
            warn!(code, user_id = %user_id, "Invite code was redeemed by another account");
            return Grant::fallback(InviteResult::ClaimedByOther);
        }

        match self.db.mark_invite_used(code, user_id, Utc::now()).await {
            Ok(true) => {
                info!(code, user_id = %user_id, "Invite code consumed");
                granted(InviteResult::Consumed)
            }
            Ok(false) => {
                warn!(code, user_id = %user_id, "Invite code was claimed concurrently");
                Grant::fallback(InviteResult::ClaimedByOther)
            }
            Err(e) => {
                warn!(code, user_id = %user_id, error = %e, "Invite consumption failed");
                Grant::fallback(InviteResult::Failed(e.to_string()))
            }
        }
    }

    /// Create the profile for `grant`. Skipped when the invite could not be
    /// checked, so a later sign-in can retry recovery.
    async fn create_profile(&self, user_id: Uuid, grant: &Grant) -> ProfileResult {
        if let InviteResult::Failed(reason) = &grant.invite {
            return ProfileResult::Failed(format!("invite could not be verified: {reason}"));
        }
        match self
            .profiles
            .materialize(user_id, grant.role, grant.tier_level)
            .await
        {
            Ok(_) => ProfileResult::Created,
            Err(e) if e.is_unique_violation() => ProfileResult::AlreadyExisted,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Profile creation failed");
                ProfileResult::Failed(e.to_string())
            }
        }
    }
}
