//! Unified application error model.
//! One enum covers every failure the session/access layer can observe, so the
//! retry loop, the session store and the role resolver can all classify an
//! error the same way, and the HTTP surface can map it to a status code.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    /// No probe endpoint was reachable.
    Connectivity { code: String, message: String },
    /// Retryable service or network failure.
    Transient { code: String, message: String },
    /// Expected absence of a record. Always converted into a fallback value.
    NotFound { code: String, message: String },
    /// Any other backend failure. Not retried.
    Permanent { code: String, message: String },
    /// Missing or malformed configuration. Fatal at startup.
    Configuration { code: String, message: String },
    /// Rejected credentials at the auth endpoints.
    Auth { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::Connectivity { code, .. }
            | AppError::Transient { code, .. }
            | AppError::NotFound { code, .. }
            | AppError::Permanent { code, .. }
            | AppError::Configuration { code, .. }
            | AppError::Auth { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::Connectivity { message, .. }
            | AppError::Transient { message, .. }
            | AppError::NotFound { message, .. }
            | AppError::Permanent { message, .. }
            | AppError::Configuration { message, .. }
            | AppError::Auth { message, .. } => message.as_str(),
        }
    }

    pub fn connectivity<S: Into<String>>(code: S, msg: S) -> Self { AppError::Connectivity { code: code.into(), message: msg.into() } }
    pub fn transient<S: Into<String>>(code: S, msg: S) -> Self { AppError::Transient { code: code.into(), message: msg.into() } }
    pub fn not_found<S: Into<String>>(code: S, msg: S) -> Self { AppError::NotFound { code: code.into(), message: msg.into() } }
    pub fn permanent<S: Into<String>>(code: S, msg: S) -> Self { AppError::Permanent { code: code.into(), message: msg.into() } }
    pub fn configuration<S: Into<String>>(code: S, msg: S) -> Self { AppError::Configuration { code: code.into(), message: msg.into() } }
    pub fn auth<S: Into<String>>(code: S, msg: S) -> Self { AppError::Auth { code: code.into(), message: msg.into() } }

    /// Connectivity and transient failures are worth another attempt; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Connectivity { .. } | AppError::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool { matches!(self, AppError::NotFound { .. }) }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::Connectivity { .. } => 503,
            AppError::Transient { .. } => 503,
            AppError::NotFound { .. } => 404,
            AppError::Permanent { .. } => 502,
            AppError::Configuration { .. } => 500,
            AppError::Auth { .. } => 401,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        // Default mapping: anything untyped is treated as a permanent failure
        AppError::Permanent { code: "internal".into(), message: err.to_string() }
    }
}
