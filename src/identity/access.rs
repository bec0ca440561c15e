use serde::Serialize;

use super::role::{Action, PermissionSet, Role};

/// Snapshot of a caller's resolved role and grants, plus whether resolution is
/// still running. All authorization checks go through this type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Access {
    pub loading: bool,
    pub role: Option<Role>,
    pub permissions: PermissionSet,
}

impl Access {
    pub fn new(role: Option<Role>, permissions: PermissionSet) -> Self {
        Self { loading: false, role, permissions }
    }

    /// Nothing is allowed while loading or without a role. Admin is allowed everything.
    /// Otherwise any single grant matching on resource (`*` or exact) and on action
    /// (`manage` or exact) is enough.
    pub fn has_permission(&self, resource: &str, action: Action) -> bool {
        if self.loading { return false; }
        let Some(role) = self.role else { return false; };
        if role == Role::Admin { return true; }
        self.permissions.iter().any(|p| p.grants(resource, action))
    }

    pub fn is_admin(&self) -> bool { self.role == Some(Role::Admin) }
    pub fn is_manager(&self) -> bool { matches!(self.role, Some(Role::Manager) | Some(Role::Admin)) }
    pub fn is_technician(&self) -> bool { self.role == Some(Role::Technician) }
    pub fn is_receptionist(&self) -> bool { self.role == Some(Role::Receptionist) }
    pub fn is_customer(&self) -> bool { self.role == Some(Role::Customer) }
}
