//! Confirmation handler: runs when the user follows the emailed link.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::finalize::{FinalizeOutcome, Finalizer};
use crate::identity::{AuthClient, Session};
use crate::local::ClientContext;

/// Login-view error markers.
pub mod login_errors {
    /// The session could not be read.
    pub const CALLBACK_FAILED: &str = "auth_callback_failed";
    /// The link's tokens were rejected.
    pub const SESSION_EXCHANGE_FAILED: &str = "session_exchange_failed";
    /// The provider redirected back with an error (expired or reused link).
    pub const LINK_INVALID: &str = "link_invalid";
}

/// Phases of the confirmation callback.
///
/// Start → SessionChecked → [TokenExchange →] SessionEstablished →
/// HasPendingRegistration → Finalizing → Done, or
/// SessionEstablished → NoPendingRegistration → Done. Any phase before
/// SessionEstablished may end early in Done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackPhase {
    Start,
    SessionChecked,
    TokenExchange,
    SessionEstablished,
    HasPendingRegistration,
    NoPendingRegistration,
    Finalizing,
    Done,
}

impl CallbackPhase {
    /// Check if a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: CallbackPhase) -> bool {
        use CallbackPhase::*;
        matches!(
            (self, target),
            (Start, SessionChecked)
                | (Start, Done)
                | (SessionChecked, TokenExchange)
                | (SessionChecked, SessionEstablished)
                | (SessionChecked, Done)
                | (TokenExchange, SessionEstablished)
                | (TokenExchange, Done)
                | (SessionEstablished, HasPendingRegistration)
                | (SessionEstablished, NoPendingRegistration)
                | (HasPendingRegistration, Finalizing)
                | (Finalizing, Done)
                | (NoPendingRegistration, Done)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl std::fmt::Display for CallbackPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Start => "start",
            Self::SessionChecked => "session_checked",
            Self::TokenExchange => "token_exchange",
            Self::SessionEstablished => "session_established",
            Self::HasPendingRegistration => "has_pending_registration",
            Self::NoPendingRegistration => "no_pending_registration",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
        };
        write!(f, "{s}")
    }
}

/// Query parameters carried by the confirmation link.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl CallbackParams {
    fn token_pair(&self) -> Option<(&str, &str)> {
        match (self.access_token.as_deref(), self.refresh_token.as_deref()) {
            (Some(access), Some(refresh)) if !access.is_empty() && !refresh.is_empty() => {
                Some((access, refresh))
            }
            _ => None,
        }
    }
}

/// Where a flow sends the user next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "to", rename_all = "snake_case")]
pub enum Navigation {
    ProfileSetup,
    Dashboard,
    Login {
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        confirmed: bool,
    },
    Redirect {
        location: String,
        confirmed: bool,
    },
}

pub const PROFILE_SETUP_PATH: &str = "/profile-setup";
pub const DASHBOARD_PATH: &str = "/dashboard";
pub const LOGIN_PATH: &str = "/login";

impl Navigation {
    pub fn login_error(code: &str) -> Self {
        Self::Login {
            error: Some(code.to_string()),
            confirmed: false,
        }
    }

    /// Relative URL for this navigation.
    pub fn to_location(&self) -> String {
        match self {
            Self::ProfileSetup => PROFILE_SETUP_PATH.to_string(),
            Self::Dashboard => DASHBOARD_PATH.to_string(),
            Self::Login { error, confirmed } => {
                let mut location = LOGIN_PATH.to_string();
                if let Some(error) = error {
                    location = with_query(&location, "error", error);
                }
                if *confirmed {
                    location = with_query(&location, "confirmed", "true");
                }
                location
            }
            Self::Redirect {
                location,
                confirmed,
            } => {
                if *confirmed {
                    with_query(location, "confirmed", "true")
                } else {
                    location.clone()
                }
            }
        }
    }
}

fn with_query(location: &str, key: &str, value: &str) -> String {
    let sep = if location.contains('?') { '&' } else { '?' };
    format!("{location}{sep}{key}={value}")
}

/// Accept a caller-supplied `next` only if it is a local path.
pub fn safe_next(next: Option<&str>, default: &str) -> String {
    match next.map(str::trim) {
        Some(path)
            if path.starts_with('/')
                && !path.starts_with("//")
                && !path.contains('\\')
                && !path.chars().any(|c| c.is_whitespace() || c.is_control()) =>
        {
            path.to_string()
        }
        _ => default.to_string(),
    }
}

/// Result of handling one callback.
#[derive(Debug, Clone)]
pub struct CallbackResult {
    pub navigation: Navigation,
    /// Phases visited, in order.
    pub trace: Vec<CallbackPhase>,
    pub finalize: Option<FinalizeOutcome>,
}

/// Records phase changes and flags impossible ones.
struct PhaseTrace {
    phases: Vec<CallbackPhase>,
}

impl PhaseTrace {
    fn new() -> Self {
        Self {
            phases: vec![CallbackPhase::Start],
        }
    }

    fn current(&self) -> CallbackPhase {
        self.phases
            .last()
            .copied()
            .unwrap_or(CallbackPhase::Start)
    }

    fn enter(&mut self, next: CallbackPhase) {
        let current = self.current();
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "Unexpected callback phase transition");
        }
        debug!(from = %current, to = %next, "Callback phase");
        self.phases.push(next);
    }

    fn finish(mut self, navigation: Navigation, finalize: Option<FinalizeOutcome>) -> CallbackResult {
        self.enter(CallbackPhase::Done);
        CallbackResult {
            navigation,
            trace: self.phases,
            finalize,
        }
    }
}

/// Establishes the session from the emailed link and finalizes the staged
/// registration, ending in a navigation.
#[derive(Clone)]
pub struct ConfirmationHandler {
    auth: AuthClient,
    finalizer: Finalizer,
    default_next: String,
}

impl ConfirmationHandler {
    pub fn new(auth: AuthClient, finalizer: Finalizer, default_next: impl Into<String>) -> Self {
        Self {
            auth,
            finalizer,
            default_next: default_next.into(),
        }
    }

    pub async fn handle(&self, context: &ClientContext, params: &CallbackParams) -> CallbackResult {
        let mut trace = PhaseTrace::new();
        let next = safe_next(params.next.as_deref(), &self.default_next);

        if params.error.is_some() || params.error_description.is_some() {
            warn!(
                context = %context.id(),
                error = params.error.as_deref().unwrap_or_default(),
                description = params.error_description.as_deref().unwrap_or_default(),
                "Confirmation link returned an error"
            );
            return trace.finish(Navigation::login_error(login_errors::LINK_INVALID), None);
        }

        let mut session = match self.auth.get_session(context).await {
            Ok(session) => session,
            Err(e) => {
                warn!(context = %context.id(), error = %e, "Session check failed");
                return trace.finish(Navigation::login_error(login_errors::CALLBACK_FAILED), None);
            }
        };
        trace.enter(CallbackPhase::SessionChecked);

        if let Some((access, refresh)) = params.token_pair() {
            trace.enter(CallbackPhase::TokenExchange);
            match self.auth.set_session(context, access, refresh).await {
                Ok(established) => session = Some(established),
                Err(e) => {
                    warn!(context = %context.id(), error = %e, "Token exchange failed");
                    return trace.finish(
                        Navigation::login_error(login_errors::SESSION_EXCHANGE_FAILED),
                        None,
                    );
                }
            }
        }

        let Some(session) = session else {
            debug!(context = %context.id(), "No session after callback; default redirect");
            return trace.finish(
                Navigation::Redirect {
                    location: next,
                    confirmed: false,
                },
                None,
            );
        };
        trace.enter(CallbackPhase::SessionEstablished);

        if !self.has_pending_for(context, &session).await {
            trace.enter(CallbackPhase::NoPendingRegistration);
            return trace.finish(
                Navigation::Redirect {
                    location: next,
                    confirmed: true,
                },
                None,
            );
        }
        trace.enter(CallbackPhase::HasPendingRegistration);
        trace.enter(CallbackPhase::Finalizing);

        match self.finalizer.finalize_pending(context, &session).await {
            Ok(Some(outcome)) => {
                info!(
                    context = %context.id(),
                    user_id = %session.user.id,
                    profile = ?outcome.profile,
                    invite = ?outcome.invite,
                    "Confirmation finalized registration"
                );
                trace.finish(Navigation::ProfileSetup, Some(outcome))
            }
            Ok(None) => {
                debug!(context = %context.id(), "Pending registration changed during finalization");
                trace.finish(
                    Navigation::Redirect {
                        location: next,
                        confirmed: true,
                    },
                    None,
                )
            }
            Err(e) => {
                warn!(context = %context.id(), error = %e, "Finalizing pending registration failed");
                trace.finish(
                    Navigation::Redirect {
                        location: next,
                        confirmed: true,
                    },
                    None,
                )
            }
        }
    }

    /// Whether `context` holds a pending registration for the session's account.
    async fn has_pending_for(&self, context: &ClientContext, session: &Session) -> bool {
        let email = session.user.email.as_deref().unwrap_or_default();
        match context.pending_registrations().peek().await {
            Ok(Some(staged)) => staged.registration.belongs_to(email),
            Ok(None) => false,
            Err(e) => {
                warn!(context = %context.id(), error = %e, "Could not read pending registration");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::identity::{IdentityProvider, InMemoryIdentityProvider, SignUpMetadata};
    use crate::error::StorageError;
    use crate::local::context::slot_keys;
    use crate::local::{ClientContexts, ContextId, LocalStorage, MemoryStorage};
    use crate::registration::finalize::ProfileResult;
    use crate::registration::model::{PendingRegistration, RegistrationMode, Role, TierLevel};
    use crate::store::{Database, LibSqlBackend};

    #[test]
    fn valid_transitions() {
        use CallbackPhase::*;
        let transitions = [
            (Start, SessionChecked),
            (SessionChecked, TokenExchange),
            (TokenExchange, SessionEstablished),
            (SessionChecked, SessionEstablished),
            (SessionEstablished, HasPendingRegistration),
            (HasPendingRegistration, Finalizing),
            (Finalizing, Done),
            (SessionEstablished, NoPendingRegistration),
            (NoPendingRegistration, Done),
        ];
        for (from, to) in transitions {
            assert!(from.can_transition_to(to), "{from} should transition to {to}");
        }
    }

    #[test]
    fn invalid_transitions() {
        use CallbackPhase::*;
        // Finalizing needs a session and a pending registration
        assert!(!SessionChecked.can_transition_to(Finalizing));
        assert!(!NoPendingRegistration.can_transition_to(Finalizing));
        // Go backward
        assert!(!SessionEstablished.can_transition_to(TokenExchange));
        // Terminal
        assert!(!Done.can_transition_to(Start));
        // Once a session exists, the outcome is a pending check
        assert!(!SessionEstablished.can_transition_to(Done));
    }

    #[test]
    fn is_terminal() {
        assert!(CallbackPhase::Done.is_terminal());
        assert!(!CallbackPhase::Finalizing.is_terminal());
    }

    #[test]
    fn navigation_locations() {
        assert_eq!(Navigation::ProfileSetup.to_location(), "/profile-setup");
        assert_eq!(
            Navigation::login_error(login_errors::CALLBACK_FAILED).to_location(),
            "/login?error=auth_callback_failed"
        );
        assert_eq!(
            Navigation::Login { error: None, confirmed: true }.to_location(),
            "/login?confirmed=true"
        );
        assert_eq!(
            Navigation::Redirect { location: "/studios?page=2".into(), confirmed: true }.to_location(),
            "/studios?page=2&confirmed=true"
        );
    }

    #[test]
    fn next_must_be_local() {
        assert_eq!(safe_next(Some("/bookings"), "/dashboard"), "/bookings");
        assert_eq!(safe_next(Some("https://evil.test"), "/dashboard"), "/dashboard");
        assert_eq!(safe_next(Some("//evil.test"), "/dashboard"), "/dashboard");
        assert_eq!(safe_next(Some("/\\evil.test"), "/dashboard"), "/dashboard");
        assert_eq!(safe_next(None, "/dashboard"), "/dashboard");
    }

    struct Harness {
        handler: ConfirmationHandler,
        provider: Arc<InMemoryIdentityProvider>,
        db: Arc<dyn Database>,
        ctx: ClientContext,
    }

    async fn harness() -> Harness {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let provider = Arc::new(InMemoryIdentityProvider::new());
        let handler = ConfirmationHandler::new(
            AuthClient::new(provider.clone()),
            Finalizer::new(Arc::clone(&db)),
            "/dashboard",
        );
        let ctx = ClientContexts::new(Arc::new(MemoryStorage::new())).open_new();
        Harness {
            handler,
            provider,
            db,
            ctx,
        }
    }

    fn pending(email: &str) -> PendingRegistration {
        PendingRegistration {
            role: Role::ArtistProducer,
            tier_level: TierLevel::default(),
            email: email.into(),
            registration_mode: RegistrationMode::Public,
            invite_code: None,
            invite_data: None,
        }
    }

    async fn sign_up(provider: &InMemoryIdentityProvider, email: &str) -> (String, String) {
        let metadata = SignUpMetadata {
            role: Role::ArtistProducer,
            tier_level: TierLevel::default(),
            registration_mode: RegistrationMode::Public,
            invite_code: None,
        };
        provider
            .sign_up(email, "Passw0rd!", &metadata, Some("http://localhost/auth/callback"))
            .await
            .unwrap();
        provider.confirmation_tokens(email).unwrap()
    }

    #[tokio::test]
    async fn link_with_pending_registration_goes_to_profile_setup() {
        let h = harness().await;
        let (access, refresh) = sign_up(&h.provider, "a@example.com").await;
        h.ctx.pending_registrations().stage(pending("a@example.com")).await.unwrap();

        let params = CallbackParams {
            access_token: Some(access),
            refresh_token: Some(refresh),
            ..CallbackParams::default()
        };
        let result = h.handler.handle(&h.ctx, &params).await;

        assert_eq!(result.navigation, Navigation::ProfileSetup);
        use CallbackPhase::*;
        assert_eq!(
            result.trace,
            vec![Start, SessionChecked, TokenExchange, SessionEstablished, HasPendingRegistration, Finalizing, Done]
        );
        let outcome = result.finalize.unwrap();
        assert_eq!(outcome.profile, ProfileResult::Created);
        assert!(h.db.get_profile(outcome.user_id).await.unwrap().is_some());
        assert!(h.ctx.pending_registrations().peek().await.unwrap().is_none());
        assert!(h.ctx.setup_stage().get().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn link_without_pending_registration_redirects_confirmed() {
        let h = harness().await;
        let (access, refresh) = sign_up(&h.provider, "a@example.com").await;
        let params = CallbackParams {
            access_token: Some(access),
            refresh_token: Some(refresh),
            next: Some("/studios".into()),
            ..CallbackParams::default()
        };
        let result = h.handler.handle(&h.ctx, &params).await;
        assert_eq!(result.navigation.to_location(), "/studios?confirmed=true");
        assert!(result.trace.contains(&CallbackPhase::NoPendingRegistration));
    }

    /// Memory storage that refuses to write the profile-setup slot.
    struct SetupWriteFails(MemoryStorage);

    #[async_trait::async_trait]
    impl LocalStorage for SetupWriteFails {
        async fn get(&self, scope: &ContextId, key: &str) -> Result<Option<String>, StorageError> {
            self.0.get(scope, key).await
        }

        async fn set(&self, scope: &ContextId, key: &str, value: &str) -> Result<(), StorageError> {
            if key == slot_keys::PROFILE_SETUP {
                return Err(StorageError::Backend("disk full".into()));
            }
            self.0.set(scope, key, value).await
        }

        async fn remove(&self, scope: &ContextId, key: &str) -> Result<bool, StorageError> {
            self.0.remove(scope, key).await
        }
    }

    #[tokio::test]
    async fn failed_finalization_still_traces_the_attempt() {
        let mut h = harness().await;
        h.ctx = ClientContexts::new(Arc::new(SetupWriteFails(MemoryStorage::new()))).open_new();
        let (access, refresh) = sign_up(&h.provider, "a@example.com").await;
        h.ctx.pending_registrations().stage(pending("a@example.com")).await.unwrap();

        let params = CallbackParams {
            access_token: Some(access),
            refresh_token: Some(refresh),
            next: Some("/studios".into()),
            ..CallbackParams::default()
        };
        let result = h.handler.handle(&h.ctx, &params).await;

        use CallbackPhase::*;
        assert_eq!(
            result.trace,
            vec![Start, SessionChecked, TokenExchange, SessionEstablished, HasPendingRegistration, Finalizing, Done]
        );
        assert!(result.finalize.is_none());
        assert_eq!(result.navigation.to_location(), "/studios?confirmed=true");
    }

    #[tokio::test]
    async fn pending_entry_for_another_account_is_not_finalized() {
        let h = harness().await;
        let (access, refresh) = sign_up(&h.provider, "a@example.com").await;
        h.ctx.pending_registrations().stage(pending("b@example.com")).await.unwrap();

        let params = CallbackParams {
            access_token: Some(access),
            refresh_token: Some(refresh),
            ..CallbackParams::default()
        };
        let result = h.handler.handle(&h.ctx, &params).await;

        use CallbackPhase::*;
        assert_eq!(
            result.trace,
            vec![Start, SessionChecked, TokenExchange, SessionEstablished, NoPendingRegistration, Done]
        );
        assert!(h.ctx.pending_registrations().peek().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn no_session_and_no_tokens_redirects_without_marker() {
        let h = harness().await;
        let result = h.handler.handle(&h.ctx, &CallbackParams::default()).await;
        assert_eq!(result.navigation.to_location(), "/dashboard");
        assert_eq!(
            result.trace,
            vec![CallbackPhase::Start, CallbackPhase::SessionChecked, CallbackPhase::Done]
        );
    }

    #[tokio::test]
    async fn rejected_tokens_go_to_login_error() {
        let h = harness().await;
        h.ctx.pending_registrations().stage(pending("a@example.com")).await.unwrap();
        let params = CallbackParams {
            access_token: Some("bogus".into()),
            refresh_token: Some("bogus".into()),
            ..CallbackParams::default()
        };
        let result = h.handler.handle(&h.ctx, &params).await;
        assert_eq!(
            result.navigation,
            Navigation::login_error(login_errors::SESSION_EXCHANGE_FAILED)
        );
        assert!(h.ctx.pending_registrations().peek().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn provider_error_in_link_goes_to_login_error() {
        let h = harness().await;
        let params = CallbackParams {
            error: Some("access_denied".into()),
            error_description: Some("Email link is invalid or has expired".into()),
            ..CallbackParams::default()
        };
        let result = h.handler.handle(&h.ctx, &params).await;
        assert_eq!(result.navigation.to_location(), "/login?error=link_invalid");
        assert_eq!(result.trace, vec![CallbackPhase::Start, CallbackPhase::Done]);
    }
}
