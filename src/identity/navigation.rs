use serde::Serialize;

use super::access::Access;
use super::role::Action;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NavItem {
    pub label: String,
    pub href: String,
    /// Permission needed to see the item; `None` means always visible.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires: Option<(String, Action)>,
}

impl NavItem {
    pub fn open(label: &str, href: &str) -> Self {
        Self { label: label.to_string(), href: href.to_string(), requires: None }
    }

    pub fn guarded(label: &str, href: &str, resource: &str, action: Action) -> Self {
        Self { label: label.to_string(), href: href.to_string(), requires: Some((resource.to_string(), action)) }
    }
}

/// Keep only the items the caller may see. Admins see everything.
pub fn filter_navigation(items: &[NavItem], access: &Access) -> Vec<NavItem> {
    if access.is_admin() { return items.to_vec(); }
    items
        .iter()
        .filter(|item| match &item.requires {
            None => true,
            Some((resource, action)) => access.has_permission(resource, *action),
        })
        .cloned()
        .collect()
}

/// Sidebar of the dashboard.
pub fn dashboard_navigation() -> Vec<NavItem> {
    vec![
        NavItem::open("Dashboard", "/dashboard"),
        NavItem::guarded("Repairs", "/dashboard/repairs", "repairs", Action::Read),
        NavItem::guarded("Buybacks", "/dashboard/buybacks", "buybacks", Action::Read),
        NavItem::guarded("Refurbishing", "/dashboard/refurbishing", "refurbishing", Action::Read),
        NavItem::guarded("Customers", "/dashboard/customers", "customers", Action::Read),
        NavItem::guarded("Inventory", "/dashboard/inventory", "inventory", Action::Read),
        NavItem::guarded("Invoices", "/dashboard/invoices", "invoices", Action::Read),
        NavItem::guarded("Reports", "/dashboard/reports", "reports", Action::Read),
        NavItem::guarded("Users", "/dashboard/users", "users", Action::Manage),
        NavItem::guarded("Settings", "/dashboard/settings", "settings", Action::Manage),
    ]
}
