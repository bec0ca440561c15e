//!
//! fixdesk HTTP server
//! -------------------
//! Axum-based HTTP surface for the repair-shop dashboard.
//!
//! Responsibilities:
//! - Per-request route guard (see `guard`) run in front of every route.
//! - Credential exchange endpoints under `/api/auth` backed by the `Backend`.
//! - Session cookie carrying the backend access token.
//! - Dashboard endpoints exposing the caller's role, grants and navigation.
//!

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::header::{InvalidHeaderValue, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::backend::rest::RestBackend;
use crate::backend::Backend;
use crate::config::Config;
use crate::error::AppError;
use crate::identity::{dashboard_navigation, filter_navigation, Access, Action, RequestContext, RoleResolver, Session};

pub mod guard;

pub const SESSION_COOKIE: &str = "fixdesk_session";

/// Shared server state injected into all handlers and the route guard.
#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn Backend>,
    pub resolver: Arc<RoleResolver>,
}

impl AppState {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let resolver = Arc::new(RoleResolver::new(backend.clone()));
        Self { backend, resolver }
    }
}

#[derive(Debug, Deserialize)]
struct Credentials {
    email: String,
    password: String,
    #[serde(default)]
    redirect: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    redirect: Option<String>,
}

pub(crate) fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookie = headers.get("cookie")?;
    let s = cookie.to_str().ok()?;
    for part in s.split(';') {
        let p = part.trim();
        if let Some(eq) = p.find('=') {
            let (k, v) = p.split_at(eq);
            if k == name { return Some(v[1..].to_string()); }
        }
    }
    None
}

fn set_session_cookie(token: &str) -> Result<HeaderValue, InvalidHeaderValue> {
    HeaderValue::from_str(&format!("{}={}; HttpOnly; Secure; SameSite=Lax; Path=/", SESSION_COOKIE, token))
}

fn clear_session_cookie() -> HeaderValue {
    HeaderValue::from_static("fixdesk_session=deleted; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly; Secure; SameSite=Lax; Path=/")
}

/// Only same-site absolute paths are accepted as post-login targets.
fn safe_redirect(target: Option<&str>) -> String {
    match target {
        Some(t) if t.starts_with('/') && !t.starts_with("//") => t.to_string(),
        _ => guard::DASHBOARD_PATH.to_string(),
    }
}

fn error_response(e: &AppError) -> Response {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({"status": "error", "code": e.code_str(), "error": e.message()}))).into_response()
}

fn signed_in_response(session: &Session, redirect: String) -> Response {
    let mut headers = HeaderMap::new();
    match set_session_cookie(&session.access_token) {
        Ok(v) => { headers.insert(SET_COOKIE, v); }
        Err(e) => {
            error!(target: "fixdesk::server", "access token is not a valid cookie value: {}", e);
            return error_response(&AppError::permanent("invalid_token", "backend returned an unusable access token"));
        }
    }
    (StatusCode::OK, headers, Json(json!({"status": "ok", "user_id": session.user_id, "redirect": redirect}))).into_response()
}

async fn login_page(Query(q): Query<PageQuery>) -> impl IntoResponse {
    Json(json!({
        "page": "login",
        "action": "/api/auth/login",
        "fields": ["email", "password"],
        "redirect": safe_redirect(q.redirect.as_deref()),
    }))
}

async fn register_page() -> impl IntoResponse {
    Json(json!({
        "page": "register",
        "action": "/api/auth/register",
        "fields": ["email", "password"],
    }))
}

async fn login(State(state): State<AppState>, Json(payload): Json<Credentials>) -> Response {
    match state.backend.sign_in(&payload.email, &payload.password).await {
        Ok(session) => {
            info!(target: "fixdesk::server", "signed in {}", session.user_id);
            signed_in_response(&session, safe_redirect(payload.redirect.as_deref()))
        }
        Err(e) => {
            warn!(target: "fixdesk::server", "sign-in failed: {}", e);
            error_response(&e)
        }
    }
}

async fn register(State(state): State<AppState>, Json(payload): Json<Credentials>) -> Response {
    match state.backend.sign_up(&payload.email, &payload.password).await {
        Ok(Some(session)) => signed_in_response(&session, guard::DASHBOARD_PATH.to_string()),
        Ok(None) => (StatusCode::ACCEPTED, Json(json!({"status": "confirmation_required"}))).into_response(),
        Err(e) => {
            warn!(target: "fixdesk::server", "sign-up failed: {}", e);
            error_response(&e)
        }
    }
}

async fn logout() -> impl IntoResponse {
    let mut h = HeaderMap::new();
    h.insert(SET_COOKIE, clear_session_cookie());
    (StatusCode::OK, h, Json(json!({"status": "ok"})))
}

/// Role for the request. A failed lookup grants nothing, so the caller sees
/// fewer affordances instead of an error.
async fn request_access(state: &AppState, ctx: &RequestContext) -> (Access, bool) {
    match state.resolver.resolve(ctx.session.as_ref()).await {
        Ok(access) => (access, false),
        Err(e) => {
            error!(target: "fixdesk::server", "role resolution failed for {}: {}", ctx.path, e);
            (Access::new(None, Vec::new()), true)
        }
    }
}

async fn dashboard(State(state): State<AppState>, Extension(ctx): Extension<RequestContext>) -> Response {
    let (access, degraded) = request_access(&state, &ctx).await;
    let nav = filter_navigation(&dashboard_navigation(), &access);
    Json(json!({
        "user_id": ctx.user_id(),
        "role": access.role,
        "permissions": access.permissions,
        "navigation": nav,
        "degraded": degraded,
    }))
    .into_response()
}

async fn dashboard_section(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(section): Path<String>,
) -> Response {
    let (access, _) = request_access(&state, &ctx).await;
    if !access.has_permission(&section, Action::Read) {
        return (StatusCode::FORBIDDEN, Json(json!({"status": "forbidden", "section": section}))).into_response();
    }
    Json(json!({
        "section": section,
        "role": access.role,
        "create": access.has_permission(&section, Action::Create),
        "read": true,
        "update": access.has_permission(&section, Action::Update),
        "delete": access.has_permission(&section, Action::Delete),
    }))
    .into_response()
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({"status": "not_found"})))
}

/// All routes with the route guard in front of them, including the fallback.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "fixdesk ok" }))
        .route("/login", get(login_page))
        .route("/register", get(register_page))
        .route("/api/auth/login", post(login))
        .route("/api/auth/register", post(register))
        .route("/api/auth/logout", post(logout))
        .route("/dashboard", get(dashboard))
        .route("/dashboard/{section}", get(dashboard_section))
        .route("/static/{*path}", get(|| async { "fixdesk static" }))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), guard::route_guard))
        .with_state(state)
}

/// Serve on an already-bound listener.
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Start the HTTP server against the configured backend.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let backend = RestBackend::new(config.backend_url.clone(), config.backend_key.clone())?
        .with_buckets(config.storage_buckets.clone())
        .stateless();
    let state = AppState::new(Arc::new(backend));

    let addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    info!(target: "fixdesk::server", "Starting server on {} (backend {})", addr, config.backend_url);
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state).await
}
