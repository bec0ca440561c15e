//! Boundary to the hosted backend: authentication, row queries and the
//! one-time storage initialisation. Everything behind `Backend` is opaque;
//! `rest` talks to the real service over HTTP and `memory` is an in-process
//! stand-in used by tests and local runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::AppResult;
use crate::identity::role::{PermissionSet, Role};
use crate::identity::Session;

pub mod memory;
pub mod rest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthEventKind {
    SignedIn,
    SignedOut,
    TokenRefreshed,
    Other,
}

/// Pushed by the backend whenever its view of the current session changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEvent {
    pub kind: AuthEventKind,
    pub session: Option<Session>,
}

impl AuthEvent {
    pub fn new(kind: AuthEventKind, session: Option<Session>) -> Self { Self { kind, session } }
}

/// Row of the `accounts` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountProfile {
    pub id: String,
    /// Role the account owner holds. Missing on older rows.
    #[serde(default)]
    pub owner_role: Option<Role>,
}

/// Row of the `account_users` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub role: Role,
    #[serde(default)]
    pub permissions: Option<PermissionSet>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Current client session, refreshing tokens when needed.
    async fn fetch_session(&self) -> AppResult<Option<Session>>;

    /// Session for credentials presented with an incoming request.
    async fn session_for_token(&self, access_token: &str) -> AppResult<Option<Session>>;

    /// Exchange credentials for a session. Client-side backends also adopt it
    /// as their current session and emit `SignedIn`.
    async fn sign_in(&self, email: &str, password: &str) -> AppResult<Session>;

    async fn sign_up(&self, email: &str, password: &str) -> AppResult<Option<Session>>;

    async fn sign_out(&self) -> AppResult<()>;

    /// Account owned by `session.user_id`, queried with the session's own
    /// credentials. `AppError::NotFound` when the user has no account.
    async fn account_profile(&self, session: &Session) -> AppResult<AccountProfile>;

    /// Assignment of `session.user_id` on `account_id`. `AppError::NotFound`
    /// when no assignment exists for the pair.
    async fn role_assignment(&self, session: &Session, account_id: &str) -> AppResult<RoleAssignment>;

    /// Post-login initialisation (storage buckets). Idempotent on the backend side.
    async fn initialize_storage(&self, session: &Session) -> AppResult<()>;

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;
}
