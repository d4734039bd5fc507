//! HTTP surface for registration, sign-in, confirmation and the admin area.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tracing::{error, info};

use crate::admin::{AdminGate, CreateInviteRequest, InviteAdmin};
use crate::config::AppConfig;
use crate::error::{AuthError, InviteError, RegistrationError};
use crate::identity::{AuthClient, AuthUser, IdentityProvider};
use crate::local::{ClientContext, ClientContexts, ContextId, LocalStorage};
use crate::registration::model::ProfileSetup;
use crate::registration::{
    CallbackParams, ConfirmationHandler, Finalizer, InviteValidator, ProfileMaterializer,
    Registrar, RegistrationRequest, SignInFlow,
};
use crate::store::Database;

/// Cookie carrying the client context id.
pub const CONTEXT_COOKIE: &str = "wavr_context";
/// Header alternative to the cookie, for non-browser clients.
pub const CONTEXT_HEADER: &str = "x-wavr-context";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub contexts: Arc<ClientContexts>,
    pub auth: AuthClient,
    pub invites: InviteValidator,
    pub registrar: Registrar,
    pub confirmation: ConfirmationHandler,
    pub sign_in: SignInFlow,
    pub profiles: ProfileMaterializer,
    pub admin_gate: AdminGate,
    pub invite_admin: InviteAdmin,
}

impl AppState {
    pub fn new(
        db: Arc<dyn Database>,
        storage: Arc<dyn LocalStorage>,
        provider: Arc<dyn IdentityProvider>,
        config: &AppConfig,
    ) -> Self {
        let auth = AuthClient::new(provider);
        let invites = InviteValidator::new(Arc::clone(&db));
        let finalizer = Finalizer::new(Arc::clone(&db));
        let profiles = ProfileMaterializer::new(Arc::clone(&db));
        Self {
            contexts: Arc::new(ClientContexts::new(storage)),
            registrar: Registrar::new(
                auth.clone(),
                invites.clone(),
                finalizer.clone(),
                config.callback_url(),
            ),
            confirmation: ConfirmationHandler::new(
                auth.clone(),
                finalizer.clone(),
                config.default_next.clone(),
            ),
            sign_in: SignInFlow::new(auth.clone(), finalizer, profiles.clone()),
            admin_gate: AdminGate::new(auth.clone(), &config.admin_emails),
            invite_admin: InviteAdmin::new(db),
            auth,
            invites,
            profiles,
        }
    }
}

/// Build the Axum router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/invites/validate", get(validate_invite))
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/session", get(current_session))
        .route("/auth/callback", get(auth_callback))
        .route("/api/profile/setup-stage", get(setup_stage))
        .route("/api/profile/setup", post(complete_profile_setup))
        .route("/api/admin/invites", get(list_invites).post(create_invite))
        .with_state(state)
}

// ── Client context ──────────────────────────────────────────────────────

/// The caller's client context, plus whether it was minted for this request.
struct RequestContext {
    context: ClientContext,
    minted: bool,
}

impl RequestContext {
    fn resolve(state: &AppState, headers: &HeaderMap) -> Self {
        let supplied = headers
            .get(CONTEXT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(ContextId::parse)
            .or_else(|| cookie_value(headers, CONTEXT_COOKIE).and_then(ContextId::parse));
        match supplied {
            Some(id) => Self {
                context: state.contexts.open(id),
                minted: false,
            },
            None => Self {
                context: state.contexts.open_new(),
                minted: true,
            },
        }
    }

    /// Attach the context id to `response` so the client keeps using it.
    fn respond(&self, response: impl IntoResponse) -> Response {
        let mut response = response.into_response();
        let id = self.context.id().as_str();
        if let Ok(value) = HeaderValue::from_str(id) {
            response.headers_mut().insert(CONTEXT_HEADER, value);
        }
        if self.minted {
            let cookie = format!("{CONTEXT_COOKIE}={id}; Path=/; HttpOnly; SameSite=Lax");
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
        }
        response
    }
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

// ── Errors ──────────────────────────────────────────────────────────────

/// JSON error response.
struct ApiError {
    status: StatusCode,
    body: serde_json::Value,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: serde_json::json!({ "error": message.into() }),
        }
    }

    fn internal(context: &str, e: impl std::fmt::Display) -> Self {
        error!(error = %e, "{context}");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong. Please try again.")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Rejected { message, .. } => Self::new(StatusCode::BAD_REQUEST, message),
            AuthError::NoSession => Self::new(StatusCode::UNAUTHORIZED, "Not signed in"),
            AuthError::Forbidden(_) => Self::new(StatusCode::FORBIDDEN, "Admin access required"),
            e @ (AuthError::Transport(_) | AuthError::InvalidResponse(_)) => {
                error!(error = %e, "Identity provider unavailable");
                Self::new(StatusCode::BAD_GATEWAY, "Authentication service unavailable")
            }
        }
    }
}

impl From<InviteError> for ApiError {
    fn from(e: InviteError) -> Self {
        match e {
            InviteError::AlreadyExists => Self::new(StatusCode::CONFLICT, e.to_string()),
            InviteError::Malformed(_) => Self::new(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
            InviteError::GenerationExhausted { .. } => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            InviteError::Database(e) => Self::internal("Invite store failed", e),
        }
    }
}

impl From<RegistrationError> for ApiError {
    fn from(e: RegistrationError) -> Self {
        match e {
            RegistrationError::Validation(errors) => Self {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                body: serde_json::json!({
                    "error": "Please correct the highlighted fields",
                    "fields": errors.fields,
                }),
            },
            RegistrationError::Provider(e) => e.into(),
            RegistrationError::Invite(e) => e.into(),
            RegistrationError::Database(crate::error::DatabaseError::NotFound { .. }) => {
                Self::new(StatusCode::NOT_FOUND, "Profile not found")
            }
            RegistrationError::Database(e) => Self::internal("Database operation failed", e),
            RegistrationError::Storage(e) => Self::internal("Client storage failed", e),
        }
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "wavr"
    }))
}

// ── Invites ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ValidateQuery {
    #[serde(default)]
    code: String,
}

/// GET /api/invites/validate?code=
async fn validate_invite(
    State(state): State<AppState>,
    Query(query): Query<ValidateQuery>,
) -> impl IntoResponse {
    Json(state.invites.validate(&query.code).await)
}

// ── Auth ────────────────────────────────────────────────────────────────

/// POST /api/auth/register
async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RegistrationRequest>,
) -> Response {
    let rc = RequestContext::resolve(&state, &headers);
    match state.registrar.register(&rc.context, body).await {
        Ok(outcome) => rc.respond(Json(outcome)),
        Err(e) => rc.respond(ApiError::from(e)),
    }
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

/// POST /api/auth/login
async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> Response {
    let rc = RequestContext::resolve(&state, &headers);
    match state.sign_in.sign_in(&rc.context, &body.email, &body.password).await {
        Ok(outcome) => rc.respond(Json(serde_json::json!({
            "navigation": outcome.navigation,
            "location": outcome.navigation.to_location(),
            "finalize": outcome.finalize,
            "user": outcome.session.user,
            "access_token": outcome.session.access_token,
            "refresh_token": outcome.session.refresh_token,
            "expires_in": outcome.session.expires_in,
        }))),
        Err(e) => rc.respond(ApiError::from(e)),
    }
}

/// POST /api/auth/logout
async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let rc = RequestContext::resolve(&state, &headers);
    match state.auth.sign_out(&rc.context).await {
        Ok(()) => rc.respond(StatusCode::NO_CONTENT),
        Err(e) => rc.respond(ApiError::from(e)),
    }
}

/// GET /api/auth/session
///
/// The context's current user, or 401.
async fn current_session(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let rc = RequestContext::resolve(&state, &headers);
    match state.auth.get_session(&rc.context).await {
        Ok(Some(session)) => rc.respond(Json(serde_json::json!({ "user": session.user }))),
        Ok(None) => rc.respond(ApiError::from(AuthError::NoSession)),
        Err(e) => rc.respond(ApiError::from(e)),
    }
}

/// GET /auth/callback
///
/// Always answers with a redirect.
async fn auth_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Response {
    let rc = RequestContext::resolve(&state, &headers);
    let result = state.confirmation.handle(&rc.context, &params).await;
    let location = result.navigation.to_location();
    info!(context = %rc.context.id(), location = %location, "Auth callback handled");
    rc.respond(Redirect::to(&location))
}

// ── Profile ─────────────────────────────────────────────────────────────

/// GET /api/profile/setup-stage
async fn setup_stage(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let rc = RequestContext::resolve(&state, &headers);
    match rc.context.setup_stage().get().await {
        Ok(Some(stage)) => rc.respond(Json(stage)),
        Ok(None) => rc.respond(ApiError::new(StatusCode::NOT_FOUND, "No profile setup in progress")),
        Err(e) => rc.respond(ApiError::internal("Reading setup stage failed", e)),
    }
}

/// Resolve the caller: bearer token first, then the context's stored session.
async fn authenticated_user(
    state: &AppState,
    rc: &RequestContext,
    headers: &HeaderMap,
) -> Result<AuthUser, ApiError> {
    if let Some(token) = bearer_token(headers) {
        return state.auth.get_user(token).await.map_err(|e| match e {
            AuthError::Rejected { .. } => ApiError::new(StatusCode::UNAUTHORIZED, "Invalid or expired session"),
            other => other.into(),
        });
    }
    match state.auth.get_session(&rc.context).await? {
        Some(session) => Ok(session.user),
        None => Err(AuthError::NoSession.into()),
    }
}

/// POST /api/profile/setup
async fn complete_profile_setup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ProfileSetup>,
) -> Response {
    let rc = RequestContext::resolve(&state, &headers);
    let user = match authenticated_user(&state, &rc, &headers).await {
        Ok(user) => user,
        Err(e) => return rc.respond(e),
    };
    match state.profiles.complete_setup(user.id, body).await {
        Ok(profile) => {
            if let Err(e) = rc.context.setup_stage().remove().await {
                tracing::warn!(context = %rc.context.id(), error = %e, "Could not clear setup stage");
            }
            rc.respond(Json(profile))
        }
        Err(e) => rc.respond(ApiError::from(e)),
    }
}

// ── Admin ───────────────────────────────────────────────────────────────

async fn admin_user(state: &AppState, headers: &HeaderMap) -> Result<AuthUser, ApiError> {
    let token = bearer_token(headers).ok_or_else(|| ApiError::from(AuthError::NoSession))?;
    state.admin_gate.verify(token).await.map_err(|e| match e {
        AuthError::Rejected { .. } => ApiError::new(StatusCode::UNAUTHORIZED, "Invalid or expired session"),
        other => other.into(),
    })
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

/// GET /api/admin/invites
async fn list_invites(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Response {
    if let Err(e) = admin_user(&state, &headers).await {
        return e.into_response();
    }
    match state.invite_admin.list(query.limit).await {
        Ok(invites) => Json(invites).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// POST /api/admin/invites
async fn create_invite(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateInviteRequest>,
) -> Response {
    let admin = match admin_user(&state, &headers).await {
        Ok(admin) => admin,
        Err(e) => return e.into_response(),
    };
    match state.invite_admin.create(&admin, body).await {
        Ok(invite) => (StatusCode::CREATED, Json(invite)).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::identity::InMemoryIdentityProvider;
    use crate::local::MemoryStorage;
    use crate::store::LibSqlBackend;

    async fn app() -> Router {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let config = AppConfig::from_lookup(|_| None).unwrap();
        router(AppState::new(
            db,
            Arc::new(MemoryStorage::new()),
            Arc::new(InMemoryIdentityProvider::new()),
            &config,
        ))
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_service() {
        let response = app()
            .await
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["service"], "wavr");
    }

    #[tokio::test]
    async fn callback_mints_context_and_redirects() {
        let response = app()
            .await
            .oneshot(
                Request::get("/auth/callback?error=access_denied")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers()[header::LOCATION],
            "/login?error=link_invalid"
        );
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("wavr_context="));
        assert!(response.headers().contains_key(CONTEXT_HEADER));
    }

    #[tokio::test]
    async fn supplied_context_is_echoed_without_cookie() {
        let response = app()
            .await
            .oneshot(
                Request::get("/api/profile/setup-stage")
                    .header(CONTEXT_HEADER, "ctx-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[CONTEXT_HEADER], "ctx-123");
        assert!(!response.headers().contains_key(header::SET_COOKIE));
    }

    #[tokio::test]
    async fn admin_routes_require_bearer_token() {
        let response = app()
            .await
            .oneshot(Request::get("/api/admin/invites").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn reads_context_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; wavr_context=abc123; other=1"),
        );
        assert_eq!(cookie_value(&headers, CONTEXT_COOKIE), Some("abc123"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn reads_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer tok"));
        assert_eq!(bearer_token(&headers), Some("tok"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn provider_rejection_is_bad_request_verbatim() {
        let err = ApiError::from(RegistrationError::Provider(AuthError::Rejected {
            status: 422,
            message: "User already registered".into(),
        }));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.body["error"], "User already registered");
    }

    #[test]
    fn duplicate_invite_is_conflict() {
        let err = ApiError::from(InviteError::AlreadyExists);
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.body["error"], "This invite code already exists");
    }
}
