//! Session ownership and role-based access for the desk.
//! Keep the public surface thin and split implementation across sub-modules.

pub mod role;
mod access;
mod navigation;
mod request_context;
mod resolver;
mod session;

pub use access::Access;
pub use navigation::{dashboard_navigation, filter_navigation, NavItem};
pub use request_context::RequestContext;
pub use resolver::RoleResolver;
pub use role::{default_permissions, Action, Permission, PermissionSet, Role};
pub use session::{PostLoginOnce, RefreshOutcome, Session, SessionStore, Subscription, DEFAULT_CACHE_WINDOW};
