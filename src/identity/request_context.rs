use super::Session;

/// Per-request view placed into request extensions by the route guard.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub session: Option<Session>,
    pub path: String,
}

impl RequestContext {
    pub fn user_id(&self) -> Option<&str> { self.session.as_ref().map(|s| s.user_id.as_str()) }
}
