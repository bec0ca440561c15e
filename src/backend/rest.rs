use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{AccountProfile, AuthEvent, AuthEventKind, Backend, RoleAssignment};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::identity::Session;

/// Refresh this long before the access token actually expires.
const EXPIRY_MARGIN_SECS: i64 = 30;
/// Code the row API returns when a single-object request matched nothing.
const NO_ROWS_CODE: &str = "PGRST116";

#[derive(Debug, thiserror::Error)]
enum RestError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    Status { status: StatusCode, body: String, auth: bool },
    #[error("unexpected response: {0}")]
    Decode(String),
}

fn body_code(body: &str) -> Option<String> {
    let v: Value = serde_json::from_str(body).ok()?;
    match v.get("code").or_else(|| v.get("error_code")) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

impl From<RestError> for AppError {
    fn from(err: RestError) -> Self {
        match err {
            RestError::Transport(e) => {
                if e.is_connect() || e.is_timeout() || e.is_request() {
                    AppError::transient("network".to_string(), e.to_string())
                } else {
                    AppError::permanent("transport".to_string(), e.to_string())
                }
            }
            RestError::Status { status, body, auth } => {
                let code = body_code(&body).unwrap_or_else(|| status.as_u16().to_string());
                let message = format!("HTTP {}: {}", status.as_u16(), body);
                if code == NO_ROWS_CODE {
                    AppError::not_found(code, message)
                } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT {
                    AppError::transient(code, message)
                } else if auth && matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
                    AppError::auth(code, message)
                } else {
                    AppError::permanent(code, message)
                }
            }
            RestError::Decode(msg) => AppError::permanent("decode".to_string(), msg),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: AuthUser,
}

impl TokenResponse {
    fn into_session(self) -> Session {
        let expires_at = match (self.expires_at, self.expires_in) {
            (Some(at), _) => Utc.timestamp_opt(at, 0).single(),
            (None, Some(secs)) => Some(Utc::now() + chrono::Duration::seconds(secs)),
            _ => None,
        };
        Session {
            user_id: self.user.id,
            email: self.user.email,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
        }
    }
}

/// Client for the hosted auth, row and storage APIs.
///
/// Holds the client-side session (optionally persisted to a JSON file so it
/// survives restarts) and pushes auth events whenever that session changes.
pub struct RestBackend {
    base: Url,
    key: String,
    client: reqwest::Client,
    buckets: Vec<String>,
    session: RwLock<Option<Session>>,
    session_file: Option<PathBuf>,
    /// When false, sign-in and sign-up hand the session back without keeping it.
    keep_session: bool,
    events: broadcast::Sender<AuthEvent>,
}

fn load_session_file(path: &Path) -> Option<Session> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice::<Session>(&bytes) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(target: "fixdesk::rest", "ignoring unreadable session file {}: {}", path.display(), e);
            None
        }
    }
}

impl RestBackend {
    pub fn new(base: Url, key: impl Into<String>) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AppError::configuration("http_client".to_string(), e.to_string()))?;
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            base,
            key: key.into(),
            client,
            buckets: Vec::new(),
            session: RwLock::new(None),
            session_file: None,
            keep_session: true,
            events,
        })
    }

    pub fn from_config(cfg: &Config) -> AppResult<Self> {
        let mut b = Self::new(cfg.backend_url.clone(), cfg.backend_key.clone())?.with_buckets(cfg.storage_buckets.clone());
        if let Some(path) = &cfg.session_file { b = b.with_session_file(path.clone()); }
        Ok(b)
    }

    pub fn with_buckets(mut self, buckets: Vec<String>) -> Self { self.buckets = buckets; self }

    /// Persist the session to `path` and restore it from there right away.
    pub fn with_session_file(mut self, path: PathBuf) -> Self {
        if let Some(s) = load_session_file(&path) {
            info!(target: "fixdesk::rest", "restored session for {} from {}", s.user_id, path.display());
            *self.session.get_mut() = Some(s);
        }
        self.session_file = Some(path);
        self
    }

    /// Shared by many callers, as in the HTTP server: issued sessions belong to
    /// the caller and are neither stored nor announced.
    pub fn stateless(mut self) -> Self {
        self.keep_session = false;
        self.session_file = None;
        *self.session.get_mut() = None;
        self
    }

    fn adopt(&self, session: &Session) {
        if !self.keep_session { return; }
        self.store(Some(session.clone()));
        self.emit(AuthEventKind::SignedIn, Some(session.clone()));
    }

    fn url(&self, path: &str) -> AppResult<Url> {
        self.base
            .join(path)
            .map_err(|e| AppError::configuration("invalid_url".to_string(), format!("{}: {}", path, e)))
    }

    fn headers(&self, bearer: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(v) = HeaderValue::from_str(&self.key) { headers.insert("apikey", v); }
        let token = bearer.unwrap_or(&self.key);
        if let Ok(v) = HeaderValue::from_str(&format!("Bearer {}", token)) { headers.insert(AUTHORIZATION, v); }
        headers
    }

    fn current_token(&self) -> Option<String> { self.session.read().as_ref().map(|s| s.access_token.clone()) }

    fn store(&self, next: Option<Session>) {
        *self.session.write() = next.clone();
        let Some(path) = &self.session_file else { return; };
        let res = match &next {
            Some(s) => serde_json::to_vec_pretty(s).map_err(|e| e.to_string()).and_then(|b| std::fs::write(path, b).map_err(|e| e.to_string())),
            None => match std::fs::remove_file(path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.to_string()),
                _ => Ok(()),
            },
        };
        if let Err(e) = res { warn!(target: "fixdesk::rest", "could not persist session to {}: {}", path.display(), e); }
    }

    fn emit(&self, kind: AuthEventKind, session: Option<Session>) {
        let _ = self.events.send(AuthEvent::new(kind, session));
    }

    async fn send(&self, req: reqwest::RequestBuilder, auth: bool) -> Result<String, RestError> {
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(RestError::Status { status, body, auth });
        }
        Ok(body)
    }

    async fn token_grant(&self, grant: &str, payload: Value) -> AppResult<Session> {
        let mut url = self.url("/auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", grant);
        let req = self.client.post(url).headers(self.headers(None)).json(&payload);
        let body = self.send(req, true).await?;
        let tokens: TokenResponse = serde_json::from_str(&body).map_err(|e| RestError::Decode(e.to_string()))?;
        Ok(tokens.into_session())
    }

    async fn single_row<T: for<'de> Deserialize<'de>>(&self, bearer: &str, table: &str, filters: &[(&str, String)], select: &str) -> AppResult<T> {
        let mut url = self.url(&format!("/rest/v1/{}", table))?;
        {
            let mut q = url.query_pairs_mut();
            for (col, val) in filters { q.append_pair(col, &format!("eq.{}", val)); }
            q.append_pair("select", select);
        }
        let mut headers = self.headers(Some(bearer));
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.pgrst.object+json"));
        let body = self.send(self.client.get(url).headers(headers), false).await?;
        let row: T = serde_json::from_str(&body).map_err(|e| RestError::Decode(format!("{}: {}", table, e)))?;
        Ok(row)
    }
}

#[async_trait]
impl Backend for RestBackend {
    async fn fetch_session(&self) -> AppResult<Option<Session>> {
        let current = self.session.read().clone();
        let Some(session) = current else { return Ok(None); };
        if !session.is_expired_at(Utc::now() + chrono::Duration::seconds(EXPIRY_MARGIN_SECS)) {
            return Ok(Some(session));
        }
        let Some(refresh_token) = session.refresh_token.clone() else {
            self.store(None);
            self.emit(AuthEventKind::SignedOut, None);
            return Ok(None);
        };
        match self.token_grant("refresh_token", json!({ "refresh_token": refresh_token })).await {
            Ok(next) => {
                debug!(target: "fixdesk::rest", "refreshed access token for {}", next.user_id);
                self.store(Some(next.clone()));
                self.emit(AuthEventKind::TokenRefreshed, Some(next.clone()));
                Ok(Some(next))
            }
            Err(AppError::Auth { message, .. }) => {
                info!(target: "fixdesk::rest", "refresh token rejected, signing out: {}", message);
                self.store(None);
                self.emit(AuthEventKind::SignedOut, None);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn session_for_token(&self, access_token: &str) -> AppResult<Option<Session>> {
        let req = self.client.get(self.url("/auth/v1/user")?).headers(self.headers(Some(access_token)));
        match self.send(req, true).await {
            Ok(body) => {
                let user: AuthUser = serde_json::from_str(&body).map_err(|e| RestError::Decode(e.to_string()))?;
                Ok(Some(Session { user_id: user.id, email: user.email, access_token: access_token.to_string(), refresh_token: None, expires_at: None }))
            }
            Err(RestError::Status { status, .. }) if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn sign_in(&self, email: &str, password: &str) -> AppResult<Session> {
        let session = self.token_grant("password", json!({ "email": email, "password": password })).await?;
        self.adopt(&session);
        Ok(session)
    }

    async fn sign_up(&self, email: &str, password: &str) -> AppResult<Option<Session>> {
        let req = self
            .client
            .post(self.url("/auth/v1/signup")?)
            .headers(self.headers(None))
            .json(&json!({ "email": email, "password": password }));
        let body = self.send(req, true).await?;
        // Without email confirmation the response already carries tokens
        match serde_json::from_str::<TokenResponse>(&body) {
            Ok(tokens) => {
                let session = tokens.into_session();
                self.adopt(&session);
                Ok(Some(session))
            }
            Err(_) => Ok(None),
        }
    }

    async fn sign_out(&self) -> AppResult<()> {
        if let Some(token) = self.current_token() {
            let req = self.client.post(self.url("/auth/v1/logout")?).headers(self.headers(Some(&token)));
            if let Err(e) = self.send(req, true).await {
                warn!(target: "fixdesk::rest", "remote logout failed: {}", e);
            }
        }
        self.store(None);
        self.emit(AuthEventKind::SignedOut, None);
        Ok(())
    }

    async fn account_profile(&self, session: &Session) -> AppResult<AccountProfile> {
        self.single_row(&session.access_token, "accounts", &[("user_id", session.user_id.clone())], "id,owner_role").await
    }

    async fn role_assignment(&self, session: &Session, account_id: &str) -> AppResult<RoleAssignment> {
        self.single_row(
            &session.access_token,
            "account_users",
            &[("user_id", session.user_id.clone()), ("account_id", account_id.to_string())],
            "role,permissions",
        )
        .await
    }

    async fn initialize_storage(&self, session: &Session) -> AppResult<()> {
        for bucket in &self.buckets {
            let req = self
                .client
                .post(self.url("/storage/v1/bucket")?)
                .headers(self.headers(Some(&session.access_token)))
                .json(&json!({ "id": bucket, "name": bucket, "public": false }));
            match self.send(req, false).await {
                Ok(_) => info!(target: "fixdesk::rest", "created storage bucket {}", bucket),
                Err(RestError::Status { status, body, .. }) if status == StatusCode::CONFLICT || body.contains("Duplicate") || body.contains("already exists") => {
                    debug!(target: "fixdesk::rest", "storage bucket {} already exists", bucket);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> { self.events.subscribe() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16, body: &str, auth: bool) -> AppError {
        RestError::Status { status: StatusCode::from_u16(code).unwrap(), body: body.to_string(), auth }.into()
    }

    #[test]
    fn no_rows_code_maps_to_not_found() {
        let e = status(406, r#"{"code":"PGRST116","message":"JSON object requested, multiple (or no) rows returned"}"#, false);
        assert!(e.is_not_found());
        assert_eq!(e.code_str(), "PGRST116");
    }

    #[test]
    fn server_errors_are_transient_and_others_permanent() {
        assert!(matches!(status(503, "", false), AppError::Transient { .. }));
        assert!(matches!(status(429, "", false), AppError::Transient { .. }));
        assert!(matches!(status(400, r#"{"code":"42703"}"#, false), AppError::Permanent { .. }));
        assert!(matches!(status(401, "", false), AppError::Permanent { .. }));
    }

    #[test]
    fn auth_endpoint_rejections_are_auth_errors() {
        let e = status(400, r#"{"error_code":"invalid_credentials","msg":"Invalid login credentials"}"#, true);
        assert!(matches!(e, AppError::Auth { .. }));
        assert_eq!(e.code_str(), "invalid_credentials");
    }

    #[test]
    fn token_response_prefers_absolute_expiry() {
        let t: TokenResponse = serde_json::from_value(json!({
            "access_token": "a", "refresh_token": "r", "expires_in": 3600, "expires_at": 1_700_000_000,
            "user": { "id": "u1", "email": "u1@shop.test" }
        }))
        .unwrap();
        let s = t.into_session();
        assert_eq!(s.expires_at.map(|d| d.timestamp()), Some(1_700_000_000));
        assert_eq!(s.user_id, "u1");
    }

    #[tokio::test]
    async fn session_file_round_trips_and_expired_session_without_refresh_signs_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let stale = Session {
            user_id: "u1".into(),
            email: None,
            access_token: "a".into(),
            refresh_token: None,
            expires_at: Some(Utc::now() - chrono::Duration::minutes(5)),
        };
        std::fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let backend = RestBackend::new(Url::parse("http://127.0.0.1:9/").unwrap(), "anon").unwrap().with_session_file(path.clone());
        let mut rx = backend.subscribe();
        assert_eq!(backend.fetch_session().await.unwrap(), None);
        assert_eq!(rx.recv().await.unwrap().kind, AuthEventKind::SignedOut);
        assert!(!path.exists());
    }

    /// Local stand-in for the hosted auth API.
    async fn fake_auth() -> Url {
        use axum::http::{HeaderMap as AxumHeaders, StatusCode as AxumStatus};
        use axum::routing::{get, post};
        use axum::Json;

        async fn user(headers: AxumHeaders) -> (AxumStatus, Json<Value>) {
            match headers.get("authorization").and_then(|v| v.to_str().ok()) {
                Some("Bearer good") => (AxumStatus::OK, Json(json!({ "id": "u7", "email": "u7@shop.test" }))),
                Some("Bearer banned") => (AxumStatus::FORBIDDEN, Json(json!({ "msg": "forbidden" }))),
                Some("Bearer broken") => (AxumStatus::INTERNAL_SERVER_ERROR, Json(json!({ "msg": "boom" }))),
                _ => (AxumStatus::UNAUTHORIZED, Json(json!({ "msg": "invalid JWT" }))),
            }
        }
        async fn token() -> Json<Value> {
            Json(json!({ "access_token": "good", "refresh_token": "r", "expires_in": 3600, "user": { "id": "u7" } }))
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route("/auth/v1/user", get(user)).route("/auth/v1/token", post(token));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Url::parse(&format!("http://{}/", addr)).unwrap()
    }

    #[tokio::test]
    async fn rejected_tokens_mean_no_session_and_server_errors_propagate() {
        let backend = RestBackend::new(fake_auth().await, "anon").unwrap();
        let s = backend.session_for_token("good").await.unwrap().unwrap();
        assert_eq!(s.user_id, "u7");
        assert_eq!(backend.session_for_token("expired").await.unwrap(), None);
        assert_eq!(backend.session_for_token("banned").await.unwrap(), None);
        assert!(backend.session_for_token("broken").await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn stateless_backend_does_not_keep_signed_in_sessions() {
        let base = fake_auth().await;
        let shared = RestBackend::new(base.clone(), "anon").unwrap().stateless();
        let mut rx = shared.subscribe();
        let s = shared.sign_in("u7@shop.test", "pw").await.unwrap();
        assert_eq!(s.access_token, "good");
        assert_eq!(shared.fetch_session().await.unwrap(), None);
        assert!(rx.try_recv().is_err());

        let client = RestBackend::new(base, "anon").unwrap();
        let s = client.sign_in("u7@shop.test", "pw").await.unwrap();
        assert_eq!(client.fetch_session().await.unwrap(), Some(s));
    }

    #[tokio::test]
    async fn valid_restored_session_is_returned_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let fresh = Session {
            user_id: "u2".into(),
            email: Some("u2@shop.test".into()),
            access_token: "a".into(),
            refresh_token: Some("r".into()),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
        };
        std::fs::write(&path, serde_json::to_vec(&fresh).unwrap()).unwrap();
        let backend = RestBackend::new(Url::parse("http://127.0.0.1:9/").unwrap(), "anon").unwrap().with_session_file(path);
        assert_eq!(backend.fetch_session().await.unwrap(), Some(fresh));
    }
}
