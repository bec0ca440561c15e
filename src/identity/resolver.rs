use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error};

use super::access::Access;
use super::role::{default_permissions, Role};
use super::session::{Session, Subscription};
use crate::backend::{Backend, RoleAssignment};
use crate::error::AppResult;

/// Derives a caller's role and grants from backend rows.
///
/// Lookup order: account profile by user id (none => `customer`), then the
/// role assignment for that user on that account (custom grants win over
/// defaults), then the profile's owner role (absent => `admin`).
pub struct RoleResolver {
    backend: Arc<dyn Backend>,
    state: watch::Sender<Access>,
}

impl RoleResolver {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let (state, _) = watch::channel(Access { loading: true, ..Access::default() });
        Self { backend, state }
    }

    /// One resolution pass. Does not touch the published state.
    pub async fn resolve(&self, session: Option<&Session>) -> AppResult<Access> {
        let Some(session) = session else { return Ok(Access::new(None, Vec::new())); };

        let profile = match self.backend.account_profile(session).await {
            Ok(p) => p,
            Err(e) if e.is_not_found() => {
                debug!(target: "fixdesk::roles", "user {} has no account profile; treating as customer", session.user_id);
                return Ok(Access::new(Some(Role::Customer), default_permissions(Role::Customer)));
            }
            Err(e) => return Err(e),
        };

        match self.backend.role_assignment(session, &profile.id).await {
            Ok(RoleAssignment { role, permissions: Some(custom) }) => Ok(Access::new(Some(role), custom)),
            Ok(RoleAssignment { role, permissions: None }) => Ok(Access::new(Some(role), default_permissions(role))),
            Err(e) if e.is_not_found() => {
                // Account without an assignment row: fall back to the owner role, admin if unset
                let role = profile.owner_role.unwrap_or(Role::Admin);
                debug!(target: "fixdesk::roles", "no role assignment for {} on {}; owner role {}", session.user_id, profile.id, role);
                Ok(Access::new(Some(role), default_permissions(role)))
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve for `session` and publish the result. On failure the previous
    /// role and grants stay in place and only `loading` is cleared.
    pub async fn apply(&self, session: Option<&Session>) -> bool {
        if session.is_some() {
            self.state.send_if_modified(|a| !std::mem::replace(&mut a.loading, true));
        }
        match self.resolve(session).await {
            Ok(access) => {
                self.state.send_if_modified(|cur| {
                    if *cur == access { return false; }
                    *cur = access;
                    true
                });
                true
            }
            Err(e) => {
                error!(target: "fixdesk::roles", "role resolution failed; keeping previous role: {}", e);
                self.state.send_if_modified(|a| std::mem::replace(&mut a.loading, false));
                false
            }
        }
    }

    pub fn access(&self) -> Access { self.state.borrow().clone() }

    pub fn watch(&self) -> watch::Receiver<Access> { self.state.subscribe() }

    /// Re-run `apply` every time the session feed changes, starting with its
    /// current value. Stops when the handle is dropped or the feed closes.
    pub fn follow(self: &Arc<Self>, mut sessions: watch::Receiver<Option<Session>>) -> Subscription {
        let resolver = Arc::clone(self);
        Subscription::new(tokio::spawn(async move {
            loop {
                let session = sessions.borrow_and_update().clone();
                resolver.apply(session.as_ref()).await;
                if sessions.changed().await.is_err() { break; }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::AccountProfile;
    use crate::error::AppError;
    use crate::identity::role::{Action, Permission};

    fn setup() -> (Arc<MemoryBackend>, RoleResolver, Session) {
        let backend = Arc::new(MemoryBackend::new());
        let session = backend.issue("u1", Some("u1@shop.test"));
        let resolver = RoleResolver::new(backend.clone());
        (backend, resolver, session)
    }

    fn profile(owner: Option<Role>) -> AccountProfile { AccountProfile { id: "acct-1".into(), owner_role: owner } }

    #[tokio::test]
    async fn absent_session_has_no_role_and_no_grants() {
        let (backend, resolver, _) = setup();
        assert_eq!(resolver.resolve(None).await.unwrap(), Access::new(None, Vec::new()));
        assert_eq!(backend.profile_calls(), 0);
    }

    #[tokio::test]
    async fn missing_profile_defaults_to_customer() {
        let (backend, resolver, s) = setup();
        let acc = resolver.resolve(Some(&s)).await.unwrap();
        assert_eq!(acc.role, Some(Role::Customer));
        assert_eq!(acc.permissions, default_permissions(Role::Customer));
        assert_eq!(backend.assignment_calls(), 0);
    }

    #[tokio::test]
    async fn custom_permissions_are_used_verbatim() {
        let (backend, resolver, s) = setup();
        backend.insert_profile("u1", profile(Some(Role::Admin)));
        let custom = vec![Permission::new("repairs", Action::Manage)];
        backend.insert_assignment("u1", "acct-1", RoleAssignment { role: Role::Technician, permissions: Some(custom.clone()) });
        let acc = resolver.resolve(Some(&s)).await.unwrap();
        assert_eq!(acc.role, Some(Role::Technician));
        assert_eq!(acc.permissions, custom);
    }

    #[tokio::test]
    async fn assignment_without_custom_set_uses_role_defaults() {
        let (backend, resolver, s) = setup();
        backend.insert_profile("u1", profile(None));
        backend.insert_assignment("u1", "acct-1", RoleAssignment { role: Role::Receptionist, permissions: None });
        let acc = resolver.resolve(Some(&s)).await.unwrap();
        assert_eq!(acc.role, Some(Role::Receptionist));
        assert_eq!(acc.permissions, default_permissions(Role::Receptionist));
    }

    #[tokio::test]
    async fn no_assignment_falls_back_to_owner_role_then_admin() {
        let (backend, resolver, s) = setup();
        backend.insert_profile("u1", profile(Some(Role::Manager)));
        assert_eq!(resolver.resolve(Some(&s)).await.unwrap().role, Some(Role::Manager));
        backend.insert_profile("u1", profile(None));
        let acc = resolver.resolve(Some(&s)).await.unwrap();
        assert_eq!(acc.role, Some(Role::Admin));
        assert_eq!(acc.permissions, default_permissions(Role::Admin));
    }

    #[tokio::test]
    async fn backend_failure_keeps_previous_role() {
        let (backend, resolver, s) = setup();
        backend.insert_profile("u1", profile(Some(Role::Manager)));
        assert!(resolver.apply(Some(&s)).await);
        assert_eq!(resolver.access().role, Some(Role::Manager));

        backend.fail_queries(Some(AppError::permanent("42501", "permission denied")));
        assert!(!resolver.apply(Some(&s)).await);
        let acc = resolver.access();
        assert_eq!(acc.role, Some(Role::Manager));
        assert!(!acc.loading);
        assert!(acc.has_permission("customers", Action::Delete));
    }

    #[tokio::test]
    async fn starts_loading_and_clears_on_absent_session() {
        let (_, resolver, _) = setup();
        assert!(resolver.access().loading);
        resolver.apply(None).await;
        assert_eq!(resolver.access(), Access::new(None, Vec::new()));
    }

    #[tokio::test]
    async fn follow_recomputes_on_session_change() {
        let (backend, resolver, s) = setup();
        backend.insert_profile("u1", profile(Some(Role::Technician)));
        let resolver = Arc::new(resolver);
        let (tx, rx) = watch::channel(None);
        let mut out = resolver.watch();
        let _sub = resolver.follow(rx);

        out.wait_for(|a| !a.loading && a.role.is_none()).await.unwrap();
        tx.send(Some(s)).unwrap();
        out.wait_for(|a| a.role == Some(Role::Technician) && !a.loading).await.unwrap();
        tx.send(None).unwrap();
        out.wait_for(|a| a.role.is_none() && !a.loading).await.unwrap();
        assert!(resolver.access().permissions.is_empty());
    }
}
