//! Sign-in flow. Also the completion point for a pending registration when
//! the user signs in instead of following the emailed link.

use serde::Serialize;
use tracing::{info, warn};

use super::callback::Navigation;
use super::finalize::{FinalizeOutcome, Finalizer};
use super::profile::ProfileMaterializer;
use super::validation::validate_sign_in;
use crate::error::RegistrationError;
use crate::identity::{AuthClient, Session};
use crate::local::ClientContext;

/// Result of a successful sign-in.
#[derive(Debug, Clone, Serialize)]
pub struct SignInOutcome {
    #[serde(skip)]
    pub session: Session,
    pub navigation: Navigation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalize: Option<FinalizeOutcome>,
}

#[derive(Clone)]
pub struct SignInFlow {
    auth: AuthClient,
    finalizer: Finalizer,
    profiles: ProfileMaterializer,
}

impl SignInFlow {
    pub fn new(auth: AuthClient, finalizer: Finalizer, profiles: ProfileMaterializer) -> Self {
        Self {
            auth,
            finalizer,
            profiles,
        }
    }

    pub async fn sign_in(
        &self,
        context: &ClientContext,
        email: &str,
        password: &str,
    ) -> Result<SignInOutcome, RegistrationError> {
        validate_sign_in(email, password)?;
        let session = self
            .auth
            .sign_in_with_password(context, email.trim(), password)
            .await?;

        let finalize = match self.finalizer.finalize_pending(context, &session).await? {
            Some(outcome) => Some(outcome),
            None => self.finalizer.recover_from_metadata(context, &session).await?,
        };
        if let Some(ref outcome) = finalize {
            info!(user_id = %session.user.id, profile = ?outcome.profile, "Sign-in completed a registration");
            return Ok(SignInOutcome {
                session,
                navigation: Navigation::ProfileSetup,
                finalize,
            });
        }

        let navigation = match self.profiles.needs_setup(session.user.id).await {
            Ok(true) => Navigation::ProfileSetup,
            Ok(false) => Navigation::Dashboard,
            Err(e) => {
                warn!(user_id = %session.user.id, error = %e, "Profile lookup failed after sign-in");
                Navigation::ProfileSetup
            }
        };
        Ok(SignInOutcome {
            session,
            navigation,
            finalize: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::AuthError;
    use crate::identity::{IdentityProvider, InMemoryIdentityProvider, SignUpMetadata};
    use crate::local::{ClientContexts, MemoryStorage};
    use crate::registration::finalize::InviteResult;
    use crate::registration::model::{
        InviteCode, InviteRole, InviteStatus, PendingRegistration, ProfileSetup, RegistrationMode,
        Role, TierLevel,
    };
    use crate::store::{Database, LibSqlBackend};

    struct Harness {
        flow: SignInFlow,
        provider: Arc<InMemoryIdentityProvider>,
        db: Arc<dyn Database>,
        ctx: ClientContext,
    }

    async fn harness() -> Harness {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let provider = Arc::new(InMemoryIdentityProvider::new());
        provider.set_require_confirmation(false);
        let flow = SignInFlow::new(
            AuthClient::new(provider.clone()),
            Finalizer::new(Arc::clone(&db)),
            ProfileMaterializer::new(Arc::clone(&db)),
        );
        let ctx = ClientContexts::new(Arc::new(MemoryStorage::new())).open_new();
        Harness {
            flow,
            provider,
            db,
            ctx,
        }
    }

    async fn register(provider: &InMemoryIdentityProvider, email: &str, metadata: Option<SignUpMetadata>) {
        let metadata = metadata.unwrap_or(SignUpMetadata {
            role: Role::ArtistProducer,
            tier_level: TierLevel::default(),
            registration_mode: RegistrationMode::Public,
            invite_code: None,
        });
        provider
            .sign_up(email, "Passw0rd!", &metadata, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sign_in_drains_pending_registration() {
        let h = harness().await;
        register(&h.provider, "a@example.com", None).await;
        h.ctx
            .pending_registrations()
            .stage(PendingRegistration {
                role: Role::Studio,
                tier_level: TierLevel::new(3).unwrap(),
                email: "a@example.com".into(),
                registration_mode: RegistrationMode::Public,
                invite_code: None,
                invite_data: None,
            })
            .await
            .unwrap();

        let outcome = h.flow.sign_in(&h.ctx, "a@example.com", "Passw0rd!").await.unwrap();
        assert_eq!(outcome.navigation, Navigation::ProfileSetup);
        assert!(outcome.finalize.unwrap().cleared_pending);

        let profile = h.db.get_profile(outcome.session.user.id).await.unwrap().unwrap();
        assert_eq!(profile.role, Role::Studio);
        assert_eq!(profile.tier_level.get(), 1);
        assert!(h.ctx.pending_registrations().peek().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn signup_metadata_cannot_raise_the_tier() {
        let h = harness().await;
        register(
            &h.provider,
            "m@example.com",
            Some(SignUpMetadata {
                role: Role::Studio,
                tier_level: TierLevel::new(3).unwrap(),
                registration_mode: RegistrationMode::Public,
                invite_code: None,
            }),
        )
        .await;

        let outcome = h.flow.sign_in(&h.ctx, "m@example.com", "Passw0rd!").await.unwrap();
        assert_eq!(outcome.navigation, Navigation::ProfileSetup);
        let profile = h.db.get_profile(outcome.session.user.id).await.unwrap().unwrap();
        assert_eq!(profile.role, Role::Studio);
        assert_eq!(profile.tier_level.get(), 1);
    }

    #[tokio::test]
    async fn signup_metadata_cannot_reuse_a_claimed_invite() {
        let h = harness().await;
        let mut invite = InviteCode::new("STUDIO4821", InviteRole::Studio, TierLevel::new(2).unwrap());
        invite.status = InviteStatus::Used;
        invite.used_by = Some(uuid::Uuid::new_v4());
        h.db.insert_invite(&invite).await.unwrap();
        register(
            &h.provider,
            "m@example.com",
            Some(SignUpMetadata {
                role: Role::Studio,
                tier_level: TierLevel::new(2).unwrap(),
                registration_mode: RegistrationMode::Invite,
                invite_code: Some("STUDIO4821".into()),
            }),
        )
        .await;

        let outcome = h.flow.sign_in(&h.ctx, "m@example.com", "Passw0rd!").await.unwrap();
        assert_eq!(outcome.finalize.unwrap().invite, InviteResult::ClaimedByOther);
        let profile = h.db.get_profile(outcome.session.user.id).await.unwrap().unwrap();
        assert_eq!(profile.role, Role::ArtistProducer);
        assert_eq!(profile.tier_level.get(), 1);
    }

    #[tokio::test]
    async fn sign_in_elsewhere_recovers_from_metadata() {
        let h = harness().await;
        register(&h.provider, "a@example.com", None).await;

        let outcome = h.flow.sign_in(&h.ctx, "a@example.com", "Passw0rd!").await.unwrap();
        assert_eq!(outcome.navigation, Navigation::ProfileSetup);
        let profile = h.db.get_profile(outcome.session.user.id).await.unwrap().unwrap();
        assert_eq!(profile.role, Role::ArtistProducer);
        assert!(!profile.profile_complete);
    }

    #[tokio::test]
    async fn complete_profile_goes_to_dashboard() {
        let h = harness().await;
        register(&h.provider, "a@example.com", None).await;
        let first = h.flow.sign_in(&h.ctx, "a@example.com", "Passw0rd!").await.unwrap();
        ProfileMaterializer::new(Arc::clone(&h.db))
            .complete_setup(
                first.session.user.id,
                ProfileSetup {
                    display_name: "Ada".into(),
                    ..ProfileSetup::default()
                },
            )
            .await
            .unwrap();

        let second = h.flow.sign_in(&h.ctx, "a@example.com", "Passw0rd!").await.unwrap();
        assert_eq!(second.navigation, Navigation::Dashboard);
        assert!(second.finalize.is_none());
    }

    #[tokio::test]
    async fn incomplete_profile_goes_to_setup() {
        let h = harness().await;
        register(&h.provider, "a@example.com", None).await;
        h.flow.sign_in(&h.ctx, "a@example.com", "Passw0rd!").await.unwrap();

        let again = h.flow.sign_in(&h.ctx, "a@example.com", "Passw0rd!").await.unwrap();
        assert_eq!(again.navigation, Navigation::ProfileSetup);
        assert!(again.finalize.is_none());
    }

    #[tokio::test]
    async fn wrong_password_is_verbatim_provider_error() {
        let h = harness().await;
        register(&h.provider, "a@example.com", None).await;
        let err = h.flow.sign_in(&h.ctx, "a@example.com", "wrong").await.unwrap_err();
        assert!(matches!(err, RegistrationError::Provider(AuthError::Rejected { .. })));
        assert_eq!(err.to_string(), "Invalid login credentials");
    }

    #[tokio::test]
    async fn empty_form_fails_validation() {
        let h = harness().await;
        let err = h.flow.sign_in(&h.ctx, "", "").await.unwrap_err();
        assert!(matches!(err, RegistrationError::Validation(_)));
    }
}
