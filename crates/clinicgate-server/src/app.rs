//! HTTP application
//!
//! Wires the tenant middleware in front of a small set of routes that work
//! on the caller's session. Each request gets its own `SessionContext` over a
//! cookie jar built from the request headers; whatever the handler writes to
//! that jar goes back out as `Set-Cookie`.

use anyhow::Context;
use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clinicgate_core::classify::{
    ClassifiedError, ErrorKind, FailureShape, MAX_MANUAL_RETRIES, Presentation, RetryBudget,
    RetryDecision, classify_failure, classify_provider_code, classify_status,
};
use clinicgate_core::cookie::{CookieStore, RequestCookieStore};
use clinicgate_core::tenant::{InMemoryTenantDirectory, TenantContext};
use clinicgate_egress::{
    AuthorizedRequestClient, HttpAuthApi, RequestClientConfig, RequestError, create_client,
};
use clinicgate_ingress::{TenantResolver, tenant_middleware};
use clinicgate_session::{
    AuthApi, AuthApiError, Credentials, Identity, Profile, SessionContext, SessionError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::ServerConfig;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    config: Arc<ServerConfig>,
    auth_api: Arc<dyn AuthApi>,
    client: reqwest::Client,
}

impl AppState {
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        let client = create_client(&config.auth.client_config())
            .context("Failed to build backend HTTP client")?;
        let auth_api = Arc::new(HttpAuthApi::with_client(
            client.clone(),
            config.auth.api_base_url.clone(),
        ));
        Ok(Self {
            config: Arc::new(config),
            auth_api,
            client,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn open_session(&self, headers: &HeaderMap) -> RequestSession {
        let cookies = Arc::new(RequestCookieStore::from_headers(headers));
        let context = SessionContext::new(
            self.auth_api.clone(),
            cookies.clone() as Arc<dyn CookieStore>,
            self.config.cookies.store_config(),
            self.config.auth.lifecycle_config(),
        );
        RequestSession { cookies, context }
    }

    fn request_client(&self, session: &SessionContext) -> AuthorizedRequestClient {
        AuthorizedRequestClient::with_client(
            self.client.clone(),
            RequestClientConfig {
                base_url: self.config.auth.api_base_url.clone(),
                tenant_header: self.config.auth.tenant_header.clone(),
            },
            session.clone(),
        )
    }
}

/// Session of one request plus the jar its cookie writes land in
struct RequestSession {
    cookies: Arc<RequestCookieStore>,
    context: SessionContext,
}

impl RequestSession {
    /// Stop any timer the handler armed and emit queued cookie writes
    fn finish(self, response: impl IntoResponse) -> Response {
        self.context.shutdown();
        let mut response = response.into_response();
        self.cookies.apply_to(response.headers_mut());
        response
    }
}

/// Build the router with the tenant middleware applied to every route
pub fn router(state: AppState) -> anyhow::Result<Router> {
    let config = state.config();
    let directory = InMemoryTenantDirectory::from_records(config.tenants.clone());
    let resolver = TenantResolver::new(
        config.effective_tenant_config(),
        config.locale.clone(),
        Arc::new(directory),
    )
    .context("Invalid tenant configuration")?;
    let not_found_path = resolver.config().not_found_path.clone();

    let routes = Router::new()
        .route("/health", get(health))
        .route(&not_found_path, get(not_found))
        .route("/{locale}/session", get(session_context))
        .route("/{locale}/auth/error", get(auth_error))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/account", get(account))
        .with_state(state);

    // The middleware may rewrite the URI, so it must run before `routes` matches
    Ok(Router::new()
        .fallback_service(routes)
        .layer(middleware::from_fn_with_state(
            Arc::new(resolver),
            tenant_middleware,
        )))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn not_found() -> ApiError {
    ApiError::new(ClassifiedError::new(
        ErrorKind::TenantNotFound,
        "no active clinic for this address",
    ))
}

/// Session details rendered into server-side pages
#[derive(Debug, Serialize)]
struct SessionView {
    tenant: TenantContext,
    locale: String,
    authenticated: bool,
    identity: Option<Identity>,
    access_expires_at: Option<String>,
}

impl SessionView {
    fn build(context: &SessionContext, tenant: TenantContext, locale: String) -> Self {
        let session = context.session();
        Self {
            tenant,
            locale,
            authenticated: context.lifecycle().is_authenticated(),
            identity: session.as_ref().and_then(|s| s.identity.clone()),
            access_expires_at: session
                .and_then(|s| s.access_expires_at)
                .map(|at| at.to_rfc3339()),
        }
    }
}

async fn session_context(
    State(state): State<AppState>,
    Path(locale): Path<String>,
    Extension(tenant): Extension<TenantContext>,
    headers: HeaderMap,
) -> Response {
    let session = state.open_session(&headers);
    let lifecycle = session.context.lifecycle();

    // An expired access cookie with a live refresh cookie is renewed here so
    // the page renders signed in.
    if !lifecycle.is_authenticated()
        && session.context.store().refresh_token().is_some()
        && let Err(e) = lifecycle.refresh().await
    {
        debug!("Server-side refresh failed: {}", e);
    }

    if lifecycle.is_authenticated()
        && session.context.session().is_some_and(|s| s.identity.is_none())
        && let Err(e) = lifecycle.load_profile().await
    {
        warn!("Profile unavailable for session view: {}", e);
    }

    let view = SessionView::build(&session.context, tenant, locale);
    session.finish(Json(view))
}

#[derive(Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> Response {
    let session = state.open_session(&headers);
    let lifecycle = session.context.lifecycle();

    let credentials = Credentials::new(request.email, request.password);
    if let Err(e) = lifecycle.authenticate(&credentials).await {
        let response = ApiError::from_session_error(&e);
        return session.finish(response);
    }

    if let Err(e) = lifecycle.load_profile().await {
        warn!("Signed in but profile could not be loaded: {}", e);
    }

    let locale = state.config().locale.default_locale.clone();
    let view = SessionView::build(&session.context, tenant, locale);
    session.finish(Json(view))
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let session = state.open_session(&headers);
    session.context.lifecycle().logout().await;
    session.finish(StatusCode::NO_CONTENT)
}

async fn account(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let session = state.open_session(&headers);
    let client = state.request_client(&session.context);

    let result = client.get::<Profile>("/auth/profile").await;
    match result {
        Ok(profile) => {
            let identity = Identity::from(profile);
            session.context.store().set_identity(identity.clone());
            session.finish(Json(identity))
        }
        Err(e) => {
            let response = ApiError::from_request_error(&e);
            session.finish(response)
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthErrorQuery {
    #[serde(default)]
    code: Option<String>,
    /// Manual retries already made from this page
    #[serde(default)]
    attempt: Option<u32>,
}

#[derive(Debug, Serialize)]
struct RetryView {
    allowed: bool,
    next_attempt: u32,
    remaining: u32,
}

#[derive(Debug, Serialize)]
struct AuthErrorView {
    locale: String,
    #[serde(flatten)]
    presentation: Presentation,
    retry: Option<RetryView>,
    force_sign_in: bool,
}

/// Classify a sign-in failure reported by the provider callback
async fn auth_error(
    Path(locale): Path<String>,
    Query(query): Query<AuthErrorQuery>,
) -> Json<AuthErrorView> {
    let classified = match query.code.as_deref() {
        Some(code) => classify_provider_code(code),
        None => classify_failure(&FailureShape::MissingParameter("code".to_string())),
    };
    classified.log();
    let presentation = classified.presentation();

    let mut retry = None;
    let mut force_sign_in = false;
    if classified.retryable {
        let mut budget = RetryBudget::resume(MAX_MANUAL_RETRIES, query.attempt.unwrap_or(0));
        match budget.try_consume() {
            RetryDecision::Retry { remaining } => {
                retry = Some(RetryView {
                    allowed: true,
                    next_attempt: budget.attempts_used(),
                    remaining,
                });
            }
            RetryDecision::ForceSignIn => force_sign_in = true,
        }
    }

    Json(AuthErrorView {
        locale,
        presentation,
        retry,
        force_sign_in,
    })
}

/// Classified failure rendered as JSON
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    classified: ClassifiedError,
}

impl ApiError {
    fn new(classified: ClassifiedError) -> Self {
        Self {
            status: status_for(classified.kind),
            classified,
        }
    }

    fn with_status(status: Option<u16>, classified: ClassifiedError) -> Self {
        let status = status
            .and_then(|s| StatusCode::from_u16(s).ok())
            .unwrap_or_else(|| status_for(classified.kind));
        Self { status, classified }
    }

    fn from_request_error(error: &RequestError) -> Self {
        Self::with_status(error.status(), error.classify())
    }

    fn from_session_error(error: &SessionError) -> Self {
        match error {
            SessionError::Api(api) => Self::with_status(api.status(), classify_auth_api(api)),
            SessionError::NotAuthenticated | SessionError::Refresh(_) => {
                Self::new(classify_status(401))
            }
            SessionError::InvalidCredential(detail) => {
                Self::new(ClassifiedError::new(ErrorKind::InvalidRequest, detail.clone()))
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.classified.log();
        let body = serde_json::json!({
            "error": self.classified.presentation(),
            "retryable": self.classified.retryable,
        });
        (self.status, Json(body)).into_response()
    }
}

fn classify_auth_api(error: &AuthApiError) -> ClassifiedError {
    match error {
        AuthApiError::Unauthorized(_) => classify_status(401),
        AuthApiError::Status { status, .. } => classify_status(*status),
        AuthApiError::Network(_) => classify_failure(&FailureShape::Network),
        AuthApiError::Timeout => classify_failure(&FailureShape::Timeout),
        AuthApiError::InvalidResponse(detail) => {
            ClassifiedError::new(ErrorKind::ProviderError, detail.clone())
        }
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidState => StatusCode::UNAUTHORIZED,
        ErrorKind::InvalidRequest
        | ErrorKind::UserCancelled
        | ErrorKind::TenantContextMissing => StatusCode::BAD_REQUEST,
        ErrorKind::TenantNotFound => StatusCode::NOT_FOUND,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::ProviderUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::NetworkError | ErrorKind::ProviderError => StatusCode::BAD_GATEWAY,
        ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
