//! Credential Registrar: the registration form's submit path.

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::finalize::{FinalizeOutcome, Finalizer};
use super::invite::InviteValidator;
use super::model::{PendingRegistration, RegistrationMode, Role, TierLevel};
use super::validation::{RegistrationForm, fields, normalize_code, validate_registration};
use crate::error::{RegistrationError, ValidationErrors};
use crate::identity::{AuthClient, SignUpMetadata};
use crate::local::ClientContext;

/// Registration form submission.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationRequest {
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    #[serde(default)]
    pub mode: RegistrationMode,
    /// Public mode only; defaults to artist/producer.
    #[serde(default)]
    pub role: Option<Role>,
    /// Invite mode only.
    #[serde(default)]
    pub invite_code: Option<String>,
}

/// Where a successful registration leaves the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "next", rename_all = "snake_case")]
pub enum RegistrationOutcome {
    /// Confirmation email sent; the registration is staged until the link is followed.
    CheckEmail {
        email: String,
        message: String,
        #[serde(skip)]
        generation: u64,
    },
    /// The provider issued a session immediately and the registration was finalized.
    ProfileSetup {
        user_id: Uuid,
        finalize: FinalizeOutcome,
    },
}

/// Submits credentials to the identity provider and bridges the result into
/// either a staged pending registration or an immediate finalization.
#[derive(Clone)]
pub struct Registrar {
    auth: AuthClient,
    invites: InviteValidator,
    finalizer: Finalizer,
    /// Where the confirmation email links back to.
    redirect_to: String,
}

impl Registrar {
    pub fn new(
        auth: AuthClient,
        invites: InviteValidator,
        finalizer: Finalizer,
        redirect_to: impl Into<String>,
    ) -> Self {
        Self {
            auth,
            invites,
            finalizer,
            redirect_to: redirect_to.into(),
        }
    }

    pub async fn register(
        &self,
        context: &ClientContext,
        request: RegistrationRequest,
    ) -> Result<RegistrationOutcome, RegistrationError> {
        validate_registration(&RegistrationForm {
            email: &request.email,
            password: &request.password,
            confirm_password: &request.confirm_password,
            mode: request.mode,
            invite_code: request.invite_code.as_deref(),
        })?;

        let email = request.email.trim().to_string();
        let registration = self.resolve(&request, &email).await?;

        let metadata = SignUpMetadata {
            role: registration.role,
            tier_level: registration.tier_level,
            registration_mode: registration.registration_mode,
            invite_code: registration.invite_code.clone(),
        };
        let response = self
            .auth
            .sign_up(
                context,
                &email,
                &request.password,
                &metadata,
                Some(&self.redirect_to),
            )
            .await?;

        if let Some(session) = response.session {
            let user_id = session.user.id;
            info!(user_id = %user_id, mode = %registration.registration_mode, "Signup returned a session; finalizing now");
            let finalize = self
                .finalizer
                .finalize(context, user_id, &registration, None)
                .await?;
            return Ok(RegistrationOutcome::ProfileSetup { user_id, finalize });
        }

        let generation = context
            .pending_registrations()
            .stage(registration.clone())
            .await?;
        info!(
            context = %context.id(),
            role = %registration.role,
            tier = %registration.tier_level,
            mode = %registration.registration_mode,
            generation,
            "Registration staged pending email confirmation"
        );

        Ok(RegistrationOutcome::CheckEmail {
            message: format!(
                "Registration successful! Please check your email ({email}) to confirm your account."
            ),
            email,
            generation,
        })
    }

    /// Role, tier and invite snapshot for this submission.
    async fn resolve(
        &self,
        request: &RegistrationRequest,
        email: &str,
    ) -> Result<PendingRegistration, RegistrationError> {
        match request.mode {
            RegistrationMode::Public => Ok(PendingRegistration {
                role: request.role.unwrap_or_default(),
                tier_level: TierLevel::default(),
                email: email.to_string(),
                registration_mode: RegistrationMode::Public,
                invite_code: None,
                invite_data: None,
            }),
            RegistrationMode::Invite => {
                let code = normalize_code(request.invite_code.as_deref().unwrap_or_default());
                let check = self.invites.validate(&code).await;
                let invite = match check.data {
                    Some(invite) if check.is_valid => invite,
                    _ => return Err(invite_field_error("Invalid or already used invite code")),
                };
                let Some(role) = invite.role_type.profile_role() else {
                    return Err(invite_field_error(
                        "This invite code cannot be used to create an account",
                    ));
                };
                Ok(PendingRegistration {
                    role,
                    tier_level: invite.tier_level,
                    email: email.to_string(),
                    registration_mode: RegistrationMode::Invite,
                    invite_code: Some(invite.code.clone()),
                    invite_data: Some(invite),
                })
            }
        }
    }
}

fn invite_field_error(message: &str) -> RegistrationError {
    let mut errors = ValidationErrors::new();
    errors.add(fields::INVITE_CODE, message);
    RegistrationError::Validation(errors)
}
