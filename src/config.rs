//!
//! fixdesk configuration
//! ---------------------
//! Values come from `FIXDESK_*` environment variables, optionally overridden by
//! command-line flags (CLI > env > default). The backend URL and key are
//! required; everything else has a default.

use std::path::PathBuf;
use std::time::Duration;

use reqwest::Url;

use crate::connectivity::{DEFAULT_PROBE_TIMEOUT, DEFAULT_PROBE_URLS};
use crate::error::{AppError, AppResult};
use crate::identity::DEFAULT_CACHE_WINDOW;
use crate::retry::RetryPolicy;

pub const DEFAULT_HTTP_PORT: u16 = 3000;
pub const DEFAULT_BUCKETS: [&str; 2] = ["ticket-photos", "documents"];

#[derive(Debug, Clone)]
pub struct Config {
    pub backend_url: Url,
    pub backend_key: String,
    pub http_port: u16,
    pub probe_urls: Vec<String>,
    pub probe_timeout: Duration,
    pub session_cache: Duration,
    pub retry: RetryPolicy,
    pub storage_buckets: Vec<String>,
    pub session_file: Option<PathBuf>,
}

fn required(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> AppResult<String> {
    match lookup(name) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(AppError::configuration("missing_env".to_string(), format!("{} must be set", name))),
    }
}

fn parse_num<T: std::str::FromStr>(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> AppResult<Option<T>> {
    match lookup(name) {
        None => Ok(None),
        Some(v) => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| AppError::configuration("invalid_env".to_string(), format!("{}='{}' is not a valid number", name, v))),
    }
}

fn parse_list(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Option<Vec<String>> {
    let raw = lookup(name)?;
    let items: Vec<String> = raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
    if items.is_empty() { None } else { Some(items) }
}

/// Value following `flag` in `args`, if any.
pub fn arg_value(args: &[String], flag: &str) -> Option<String> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
        i += 1;
    }
    None
}

pub fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(&|name: &str| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> AppResult<Self> {
        let raw_url = required(lookup, "FIXDESK_BACKEND_URL")?;
        let backend_url = Url::parse(&raw_url)
            .map_err(|e| AppError::configuration("invalid_env".to_string(), format!("FIXDESK_BACKEND_URL: {}", e)))?;
        let backend_key = required(lookup, "FIXDESK_BACKEND_KEY")?;

        let http_port = parse_num::<u16>(lookup, "FIXDESK_HTTP_PORT")?.unwrap_or(DEFAULT_HTTP_PORT);
        let probe_urls = parse_list(lookup, "FIXDESK_PROBE_URLS")
            .unwrap_or_else(|| DEFAULT_PROBE_URLS.iter().map(|s| s.to_string()).collect());
        let probe_timeout = parse_num::<u64>(lookup, "FIXDESK_PROBE_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_PROBE_TIMEOUT);
        let session_cache = parse_num::<u64>(lookup, "FIXDESK_SESSION_CACHE_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CACHE_WINDOW);
        let defaults = RetryPolicy::default();
        let retry = RetryPolicy::new(
            parse_num::<u32>(lookup, "FIXDESK_RETRY_MAX")?.unwrap_or(defaults.max_retries),
            parse_num::<u64>(lookup, "FIXDESK_RETRY_BASE_MS")?.map(Duration::from_millis).unwrap_or(defaults.base_delay),
        );
        let storage_buckets = parse_list(lookup, "FIXDESK_STORAGE_BUCKETS")
            .unwrap_or_else(|| DEFAULT_BUCKETS.iter().map(|s| s.to_string()).collect());
        let session_file = lookup("FIXDESK_SESSION_FILE").filter(|s| !s.trim().is_empty()).map(PathBuf::from);

        Ok(Self { backend_url, backend_key, http_port, probe_urls, probe_timeout, session_cache, retry, storage_buckets, session_file })
    }

    /// Apply `--http-port` and `--backend-url` overrides.
    pub fn apply_args(mut self, args: &[String]) -> AppResult<Self> {
        if let Some(p) = arg_value(args, "--http-port") {
            self.http_port = p
                .parse()
                .map_err(|_| AppError::configuration("invalid_arg".to_string(), format!("--http-port '{}' is not a port", p)))?;
        }
        if let Some(u) = arg_value(args, "--backend-url") {
            self.backend_url = Url::parse(&u)
                .map_err(|e| AppError::configuration("invalid_arg".to_string(), format!("--backend-url: {}", e)))?;
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let m: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k: &str| m.get(k).cloned()
    }

    const BASE: [(&str, &str); 2] = [("FIXDESK_BACKEND_URL", "https://proj.backend.test"), ("FIXDESK_BACKEND_KEY", "anon")];

    #[test]
    fn defaults_apply_when_only_required_values_are_set() {
        let cfg = Config::from_lookup(&lookup_from(&BASE)).unwrap();
        assert_eq!(cfg.http_port, DEFAULT_HTTP_PORT);
        assert_eq!(cfg.session_cache, Duration::from_secs(60));
        assert_eq!(cfg.retry, RetryPolicy::new(3, Duration::from_millis(1000)));
        assert_eq!(cfg.probe_timeout, Duration::from_secs(5));
        assert_eq!(cfg.probe_urls.len(), 3);
        assert_eq!(cfg.storage_buckets, vec!["ticket-photos", "documents"]);
        assert!(cfg.session_file.is_none());
    }

    #[test]
    fn missing_backend_url_is_a_configuration_error() {
        let err = Config::from_lookup(&lookup_from(&[("FIXDESK_BACKEND_KEY", "anon")])).unwrap_err();
        assert!(matches!(err, AppError::Configuration { .. }));
        assert!(err.message().contains("FIXDESK_BACKEND_URL"));
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let mut pairs = BASE.to_vec();
        pairs.push(("FIXDESK_RETRY_MAX", "lots"));
        assert!(matches!(Config::from_lookup(&lookup_from(&pairs)), Err(AppError::Configuration { .. })));
    }

    #[test]
    fn lists_and_overrides_are_parsed() {
        let mut pairs = BASE.to_vec();
        pairs.push(("FIXDESK_PROBE_URLS", "http://a.test, http://b.test,,"));
        pairs.push(("FIXDESK_HTTP_PORT", "8080"));
        let cfg = Config::from_lookup(&lookup_from(&pairs)).unwrap();
        assert_eq!(cfg.probe_urls, vec!["http://a.test", "http://b.test"]);
        assert_eq!(cfg.http_port, 8080);
        let args: Vec<String> = ["fixdesk", "--http-port", "9090"].iter().map(|s| s.to_string()).collect();
        assert_eq!(cfg.apply_args(&args).unwrap().http_port, 9090);
    }
}
