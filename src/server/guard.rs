//! Per-request route guard.
//! Stateless: every request re-derives session presence from its own
//! credentials and never consults the client-side session cache.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use tracing::debug;

use super::{parse_cookie, AppState, SESSION_COOKIE};
use crate::identity::{RequestContext, Session};

pub const PROTECTED_PREFIX: &str = "/dashboard";
pub const LOGIN_PATH: &str = "/login";
pub const REGISTER_PATH: &str = "/register";
pub const DASHBOARD_PATH: &str = "/dashboard";
pub const BYPASS_PREFIXES: [&str; 3] = ["/_next", "/static", "/api"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Allow,
    /// Target includes the original path as `redirect` query parameter.
    RedirectToLogin(String),
    RedirectToDashboard,
}

pub fn is_bypassed(path: &str) -> bool {
    BYPASS_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// Decide what to do with `path` given whether the request carries a session.
/// Bypassed prefixes must be filtered out before calling this.
pub fn classify(path: &str, has_session: bool) -> GuardDecision {
    if !has_session && path.starts_with(PROTECTED_PREFIX) {
        return GuardDecision::RedirectToLogin(format!("{}?redirect={}", LOGIN_PATH, urlencoding::encode(path)));
    }
    if has_session && (path == LOGIN_PATH || path == REGISTER_PATH) {
        return GuardDecision::RedirectToDashboard;
    }
    GuardDecision::Allow
}

/// Access token from the session cookie, or from an `Authorization: Bearer` header.
pub fn request_token(headers: &HeaderMap) -> Option<String> {
    if let Some(t) = parse_cookie(headers, SESSION_COOKIE).filter(|t| !t.is_empty()) {
        return Some(t);
    }
    let auth = headers.get("authorization")?.to_str().ok()?;
    auth.strip_prefix("Bearer ").map(|t| t.trim().to_string()).filter(|t| !t.is_empty())
}

async fn session_from_request(state: &AppState, headers: &HeaderMap) -> Option<Session> {
    let token = request_token(headers)?;
    match state.backend.session_for_token(&token).await {
        Ok(s) => s,
        Err(e) => {
            // Any failure reading the session counts as signed out
            debug!(target: "fixdesk::guard", "session lookup failed: {}", e);
            None
        }
    }
}

pub async fn route_guard(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    if is_bypassed(&path) {
        return next.run(req).await;
    }
    let session = session_from_request(&state, req.headers()).await;
    match classify(&path, session.is_some()) {
        GuardDecision::RedirectToLogin(to) => {
            debug!(target: "fixdesk::guard", "{} -> {}", path, to);
            Redirect::temporary(&to).into_response()
        }
        GuardDecision::RedirectToDashboard => {
            debug!(target: "fixdesk::guard", "{} -> {}", path, DASHBOARD_PATH);
            Redirect::temporary(DASHBOARD_PATH).into_response()
        }
        GuardDecision::Allow => {
            req.extensions_mut().insert(RequestContext { session, path });
            next.run(req).await
        }
    }
}
