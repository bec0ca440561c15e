use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use super::{AccountProfile, AuthEvent, AuthEventKind, Backend, RoleAssignment};
use crate::error::{AppError, AppResult};
use crate::identity::Session;

#[derive(Debug, Clone)]
struct UserEntry {
    user_id: String,
    password: String,
}

#[derive(Debug, Default)]
struct Counters {
    fetch: AtomicUsize,
    token_lookup: AtomicUsize,
    profile: AtomicUsize,
    assignment: AtomicUsize,
    storage_init: AtomicUsize,
}

/// In-process backend. Holds users, tokens and rows in memory, records how
/// often each call was made and can be told to fail or stall.
pub struct MemoryBackend {
    current: RwLock<Option<Session>>,
    users: RwLock<HashMap<String, UserEntry>>,
    tokens: RwLock<HashMap<String, Session>>,
    profiles: RwLock<HashMap<String, AccountProfile>>,
    assignments: RwLock<HashMap<(String, String), RoleAssignment>>,
    fetch_failures: Mutex<VecDeque<AppError>>,
    query_failure: Mutex<Option<AppError>>,
    token_failure: Mutex<Option<AppError>>,
    fetch_latency: Mutex<Duration>,
    counters: Counters,
    events: broadcast::Sender<AuthEvent>,
}

impl Default for MemoryBackend {
    fn default() -> Self { Self::new() }
}

fn token() -> String { format!("{:032x}", rand::random::<u128>()) }

impl MemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            current: RwLock::new(None),
            users: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            profiles: RwLock::new(HashMap::new()),
            assignments: RwLock::new(HashMap::new()),
            fetch_failures: Mutex::new(VecDeque::new()),
            query_failure: Mutex::new(None),
            token_failure: Mutex::new(None),
            fetch_latency: Mutex::new(Duration::ZERO),
            counters: Counters::default(),
            events,
        }
    }

    /// Register a user and return its id.
    pub fn add_user(&self, email: &str, password: &str) -> String {
        let user_id = format!("user-{}", &token()[..12]);
        self.users.write().insert(email.to_ascii_lowercase(), UserEntry { user_id: user_id.clone(), password: password.to_string() });
        user_id
    }

    /// Issue a session for `user_id` that `session_for_token` will accept.
    pub fn issue(&self, user_id: &str, email: Option<&str>) -> Session {
        let session = Session {
            user_id: user_id.to_string(),
            email: email.map(|e| e.to_string()),
            access_token: token(),
            refresh_token: Some(token()),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
        };
        self.tokens.write().insert(session.access_token.clone(), session.clone());
        session
    }

    pub fn set_current(&self, session: Option<Session>) { *self.current.write() = session; }

    pub fn insert_profile(&self, user_id: &str, profile: AccountProfile) {
        self.profiles.write().insert(user_id.to_string(), profile);
    }

    pub fn insert_assignment(&self, user_id: &str, account_id: &str, assignment: RoleAssignment) {
        self.assignments.write().insert((user_id.to_string(), account_id.to_string()), assignment);
    }

    /// The next `times` session fetches fail with `err`.
    pub fn fail_fetches(&self, times: usize, err: AppError) {
        let mut q = self.fetch_failures.lock();
        q.clear();
        q.extend(std::iter::repeat(err).take(times));
    }

    /// Every profile / assignment query fails with `err` until cleared with `None`.
    pub fn fail_queries(&self, err: Option<AppError>) { *self.query_failure.lock() = err; }

    /// Every `session_for_token` call fails with `err` until cleared with `None`.
    pub fn fail_token_lookups(&self, err: Option<AppError>) { *self.token_failure.lock() = err; }

    pub fn set_fetch_latency(&self, latency: Duration) { *self.fetch_latency.lock() = latency; }

    /// Push an auth event to subscribers, updating the current session first.
    pub fn emit(&self, event: AuthEvent) {
        *self.current.write() = event.session.clone();
        let _ = self.events.send(event);
    }

    pub fn fetch_calls(&self) -> usize { self.counters.fetch.load(Ordering::SeqCst) }
    pub fn token_lookups(&self) -> usize { self.counters.token_lookup.load(Ordering::SeqCst) }
    pub fn profile_calls(&self) -> usize { self.counters.profile.load(Ordering::SeqCst) }
    pub fn assignment_calls(&self) -> usize { self.counters.assignment.load(Ordering::SeqCst) }
    pub fn storage_init_calls(&self) -> usize { self.counters.storage_init.load(Ordering::SeqCst) }

    fn check_queries(&self) -> AppResult<()> {
        match self.query_failure.lock().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn fetch_session(&self) -> AppResult<Option<Session>> {
        self.counters.fetch.fetch_add(1, Ordering::SeqCst);
        let latency = *self.fetch_latency.lock();
        if !latency.is_zero() { tokio::time::sleep(latency).await; }
        if let Some(err) = self.fetch_failures.lock().pop_front() { return Err(err); }
        Ok(self.current.read().clone())
    }

    async fn session_for_token(&self, access_token: &str) -> AppResult<Option<Session>> {
        self.counters.token_lookup.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.token_failure.lock().clone() { return Err(err); }
        let found = self.tokens.read().get(access_token).cloned();
        Ok(found.filter(|s| !s.is_expired_at(Utc::now())))
    }

    async fn sign_in(&self, email: &str, password: &str) -> AppResult<Session> {
        let entry = self.users.read().get(&email.to_ascii_lowercase()).cloned();
        let Some(entry) = entry.filter(|u| u.password == password) else {
            return Err(AppError::auth("invalid_credentials", "invalid login credentials"));
        };
        let session = self.issue(&entry.user_id, Some(email));
        self.emit(AuthEvent::new(AuthEventKind::SignedIn, Some(session.clone())));
        Ok(session)
    }

    async fn sign_up(&self, email: &str, password: &str) -> AppResult<Option<Session>> {
        if self.users.read().contains_key(&email.to_ascii_lowercase()) {
            return Err(AppError::permanent("user_already_exists", "user already registered"));
        }
        self.add_user(email, password);
        self.sign_in(email, password).await.map(Some)
    }

    async fn sign_out(&self) -> AppResult<()> {
        let previous = self.current.write().take();
        if let Some(s) = previous { self.tokens.write().remove(&s.access_token); }
        self.emit(AuthEvent::new(AuthEventKind::SignedOut, None));
        Ok(())
    }

    async fn account_profile(&self, session: &Session) -> AppResult<AccountProfile> {
        self.counters.profile.fetch_add(1, Ordering::SeqCst);
        self.check_queries()?;
        self.profiles
            .read()
            .get(&session.user_id)
            .cloned()
            .ok_or_else(|| AppError::not_found("PGRST116", "no account profile for user"))
    }

    async fn role_assignment(&self, session: &Session, account_id: &str) -> AppResult<RoleAssignment> {
        self.counters.assignment.fetch_add(1, Ordering::SeqCst);
        self.check_queries()?;
        self.assignments
            .read()
            .get(&(session.user_id.clone(), account_id.to_string()))
            .cloned()
            .ok_or_else(|| AppError::not_found("PGRST116", "no role assignment for user"))
    }

    async fn initialize_storage(&self, _session: &Session) -> AppResult<()> {
        self.counters.storage_init.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> { self.events.subscribe() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sign_in_issues_a_token_the_guard_accepts() {
        let b = MemoryBackend::new();
        b.add_user("Front@Shop.test", "pw");
        let s = b.sign_in("front@shop.test", "pw").await.unwrap();
        assert_eq!(b.session_for_token(&s.access_token).await.unwrap(), Some(s.clone()));
        assert_eq!(b.fetch_session().await.unwrap(), Some(s));
        assert!(b.sign_in("front@shop.test", "nope").await.is_err());
    }

    #[tokio::test]
    async fn sign_out_revokes_token_and_notifies() {
        let b = MemoryBackend::new();
        let mut rx = b.subscribe();
        b.add_user("tech@shop.test", "pw");
        let s = b.sign_in("tech@shop.test", "pw").await.unwrap();
        b.sign_out().await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, AuthEventKind::SignedIn);
        assert_eq!(rx.recv().await.unwrap().kind, AuthEventKind::SignedOut);
        assert_eq!(b.session_for_token(&s.access_token).await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_rows_are_not_found() {
        let b = MemoryBackend::new();
        let s = b.issue("nobody", None);
        assert!(b.account_profile(&s).await.unwrap_err().is_not_found());
        assert!(b.role_assignment(&s, "acct").await.unwrap_err().is_not_found());
    }
}
