use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::{AuthEvent, AuthEventKind, Backend};
use crate::connectivity::Probe;
use crate::error::{AppError, AppResult};
use crate::retry::{with_retry, RetryPolicy};
use crate::tprintln;

pub const DEFAULT_CACHE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }
}

// Field-by-field so replacement checks never depend on serialisation order.
impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.user_id == other.user_id
            && self.email == other.email
            && self.access_token == other.access_token
            && self.refresh_token == other.refresh_token
            && self.expires_at == other.expires_at
    }
}

impl Eq for Session {}

/// Background task owned by a caller. The task is aborted when this is dropped.
#[must_use = "dropping a Subscription stops the task immediately"]
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(handle: JoinHandle<()>) -> Self { Self { handle } }

    /// Stop the task now instead of waiting for the handle to go out of scope.
    pub fn unsubscribe(self) { self.handle.abort(); }

    pub fn is_finished(&self) -> bool { self.handle.is_finished() }
}

impl Drop for Subscription {
    fn drop(&mut self) { self.handle.abort(); }
}

/// Runs a side effect once per signed-in lifetime, however often it is triggered.
///
/// `in_progress` rejects overlapping triggers; `done` rejects later ones. A
/// failed run leaves `done` unset so the next trigger tries again. A run that
/// straddles a `reset` does not mark the new lifetime as done.
#[derive(Debug, Default)]
pub struct PostLoginOnce {
    in_progress: AtomicBool,
    done: AtomicBool,
    epoch: AtomicU64,
}

struct ClearOnDrop<'a>(&'a AtomicBool);

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) { self.0.store(false, Ordering::Release); }
}

impl PostLoginOnce {
    /// Returns true when this call actually executed `effect`.
    pub async fn run<F, Fut>(&self, effect: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<()>>,
    {
        if self.done.load(Ordering::Acquire) { return false; }
        if self.in_progress.swap(true, Ordering::AcqRel) { return false; }
        let _clear = ClearOnDrop(&self.in_progress);
        if self.done.load(Ordering::Acquire) { return false; }
        let epoch = self.epoch.load(Ordering::Acquire);
        match effect().await {
            Ok(()) if self.epoch.load(Ordering::Acquire) == epoch => self.done.store(true, Ordering::Release),
            Ok(()) => debug!(target: "fixdesk::session", "post-login run finished after sign-out; not marking done"),
            Err(e) => warn!(target: "fixdesk::session", "post-login initialisation failed: {}", e),
        }
        true
    }

    pub fn is_done(&self) -> bool { self.done.load(Ordering::Acquire) }

    pub fn reset(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.done.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Another refresh was already running; nothing was fetched.
    InFlight,
    /// Last successful fetch is inside the cache window.
    Cached,
    /// Probe found no network; stored session untouched.
    Offline,
    Unchanged,
    Updated,
    /// Retries exhausted or non-retryable error; stored session untouched.
    Failed(AppError),
}

/// Process-wide owner of the current session.
///
/// Readers use `get_session` or `watch`; the stored value only changes through
/// `refresh` and auth events, and only when the new value differs from the old.
pub struct SessionStore {
    backend: Arc<dyn Backend>,
    probe: Arc<dyn Probe>,
    retry: RetryPolicy,
    cache_window: Duration,
    current: watch::Sender<Option<Session>>,
    last_fetch: Mutex<Option<Instant>>,
    refreshing: AtomicBool,
    initialized: AtomicBool,
    post_login: PostLoginOnce,
    signals: broadcast::Sender<AuthEventKind>,
}

struct RefreshGuard<'a>(&'a SessionStore);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.refreshing.store(false, Ordering::Release);
        self.0.initialized.store(true, Ordering::Release);
    }
}

impl SessionStore {
    pub fn new(backend: Arc<dyn Backend>, probe: Arc<dyn Probe>) -> Self {
        let (current, _) = watch::channel(None);
        let (signals, _) = broadcast::channel(16);
        Self {
            backend,
            probe,
            retry: RetryPolicy::default(),
            cache_window: DEFAULT_CACHE_WINDOW,
            current,
            last_fetch: Mutex::new(None),
            refreshing: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            post_login: PostLoginOnce::default(),
            signals,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self { self.retry = retry; self }

    pub fn with_cache_window(mut self, window: Duration) -> Self { self.cache_window = window; self }

    /// Cached session; never touches the network.
    pub fn get_session(&self) -> Option<Session> { self.current.borrow().clone() }

    /// True until the first refresh has finished, successfully or not.
    pub fn is_loading(&self) -> bool { !self.initialized.load(Ordering::Acquire) }

    /// Change feed of the stored session. Only fires on real changes.
    pub fn watch(&self) -> watch::Receiver<Option<Session>> { self.current.subscribe() }

    /// Fires on sign-in and sign-out so dependent views can re-render.
    pub fn signals(&self) -> broadcast::Receiver<AuthEventKind> { self.signals.subscribe() }

    pub fn post_login_done(&self) -> bool { self.post_login.is_done() }

    fn cache_is_fresh(&self) -> bool {
        match *self.last_fetch.lock() {
            Some(at) => at.elapsed() < self.cache_window,
            None => false,
        }
    }

    fn replace_if_changed(&self, next: Option<Session>) -> bool {
        self.current.send_if_modified(|cur| {
            if *cur == next { return false; }
            *cur = next;
            true
        })
    }

    async fn after_change(&self, next: Option<&Session>) {
        match next {
            Some(session) => {
                let backend = self.backend.clone();
                let ran = self.post_login.run(|| async move { backend.initialize_storage(session).await }).await;
                if ran { tprintln!("session.post_login user={}", session.user_id); }
            }
            None => self.post_login.reset(),
        }
    }

    /// Re-read the session from the backend unless a refresh is already
    /// running or the last fetch is still inside the cache window.
    pub async fn refresh(&self) -> RefreshOutcome {
        if self.refreshing.load(Ordering::Acquire) { return RefreshOutcome::InFlight; }
        if self.cache_is_fresh() { return RefreshOutcome::Cached; }
        if self.refreshing.swap(true, Ordering::AcqRel) { return RefreshOutcome::InFlight; }
        let _guard = RefreshGuard(self);

        if !self.probe.is_connected().await {
            warn!(target: "fixdesk::session", "session refresh skipped: offline");
            return RefreshOutcome::Offline;
        }

        let backend = self.backend.clone();
        let fetched = with_retry(self.probe.as_ref(), self.retry, || {
            let backend = backend.clone();
            async move { backend.fetch_session().await }
        })
        .await;

        match fetched {
            Ok(next) => {
                let changed = self.replace_if_changed(next.clone());
                *self.last_fetch.lock() = Some(Instant::now());
                if changed {
                    debug!(target: "fixdesk::session", "session changed (present={})", next.is_some());
                    self.after_change(next.as_ref()).await;
                    RefreshOutcome::Updated
                } else {
                    RefreshOutcome::Unchanged
                }
            }
            Err(e) => {
                if e.is_retryable() {
                    warn!(target: "fixdesk::session", "session refresh failed: {}", e);
                } else {
                    error!(target: "fixdesk::session", "session refresh failed: {}", e);
                }
                RefreshOutcome::Failed(e)
            }
        }
    }

    /// Apply a pushed auth event. Bypasses the cache window.
    pub async fn handle_event(&self, event: AuthEvent) {
        debug!(target: "fixdesk::session", "auth event {:?}", event.kind);
        if self.replace_if_changed(event.session.clone()) {
            self.after_change(event.session.as_ref()).await;
        }
        if matches!(event.kind, AuthEventKind::SignedIn | AuthEventKind::SignedOut) {
            let _ = self.signals.send(event.kind);
        }
    }

    /// Subscribe to backend auth events for as long as the returned handle lives.
    pub fn listen(self: &Arc<Self>) -> Subscription {
        let mut rx = self.backend.subscribe();
        let store = Arc::clone(self);
        Subscription::new(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => store.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(target: "fixdesk::session", "missed {} auth events; next refresh will resync", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!(target: "fixdesk::session", "auth event channel closed");
                        break;
                    }
                }
            }
        }))
    }

    /// Call `refresh` every `every` until the returned handle is dropped.
    pub fn spawn_refresh_loop(self: &Arc<Self>, every: Duration) -> Subscription {
        let store = Arc::clone(self);
        Subscription::new(tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let outcome = store.refresh().await;
                debug!(target: "fixdesk::session", "periodic refresh: {:?}", outcome);
            }
        }))
    }
}
