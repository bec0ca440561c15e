use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Resource identifier that matches every resource.
pub const ANY_RESOURCE: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Technician,
    Receptionist,
    Customer,
}

impl Role {
    pub const ALL: [Role; 5] = [Role::Admin, Role::Manager, Role::Technician, Role::Receptionist, Role::Customer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Technician => "technician",
            Role::Receptionist => "receptionist",
            Role::Customer => "customer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "manager" => Ok(Role::Manager),
            "technician" => Ok(Role::Technician),
            "receptionist" => Ok(Role::Receptionist),
            "customer" => Ok(Role::Customer),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
    /// Grants every action on the matching resource.
    Manage,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Read => "read",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Manage => "manage",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// A single (resource, action) grant. `resource` is either a concrete
/// identifier such as `repairs` or the wildcard `*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub resource: String,
    pub action: Action,
}

impl Permission {
    pub fn new(resource: impl Into<String>, action: Action) -> Self {
        Self { resource: resource.into(), action }
    }

    pub fn grants(&self, resource: &str, action: Action) -> bool {
        let resource_ok = self.resource == ANY_RESOURCE || self.resource == resource;
        let action_ok = self.action == Action::Manage || self.action == action;
        resource_ok && action_ok
    }
}

/// Ordered list of grants. Order has no effect on evaluation.
pub type PermissionSet = Vec<Permission>;

fn grants(items: &[(&str, Action)]) -> PermissionSet {
    items.iter().map(|(r, a)| Permission::new(*r, *a)).collect()
}

static DEFAULT_PERMISSIONS: Lazy<HashMap<Role, PermissionSet>> = Lazy::new(|| {
    use Action::*;
    let mut m = HashMap::new();
    m.insert(Role::Admin, grants(&[(ANY_RESOURCE, Manage)]));
    m.insert(Role::Manager, grants(&[
        ("customers", Manage),
        ("repairs", Manage),
        ("buybacks", Manage),
        ("refurbishing", Manage),
        ("inventory", Manage),
        ("invoices", Manage),
        ("reports", Read),
        ("users", Read),
    ]));
    m.insert(Role::Technician, grants(&[
        ("repairs", Read),
        ("repairs", Update),
        ("refurbishing", Read),
        ("refurbishing", Update),
        ("inventory", Read),
        ("customers", Read),
    ]));
    m.insert(Role::Receptionist, grants(&[
        ("customers", Create),
        ("customers", Read),
        ("customers", Update),
        ("repairs", Create),
        ("repairs", Read),
        ("buybacks", Create),
        ("buybacks", Read),
        ("invoices", Create),
        ("invoices", Read),
    ]));
    m.insert(Role::Customer, grants(&[
        ("repairs", Read),
        ("invoices", Read),
    ]));
    m
});

/// Baseline permission set for a role, used when no custom set is stored.
pub fn default_permissions(role: Role) -> PermissionSet {
    DEFAULT_PERMISSIONS.get(&role).cloned().unwrap_or_default()
}
