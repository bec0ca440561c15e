//!
//! fixdesk client
//! --------------
//! Signs in against the backend and reports who the desk thinks you are:
//! role, grants and the dashboard navigation you would see.
//!
//! `whoami` prints once. `--watch` keeps the session store and role resolver
//! running and prints every time the resolved access changes.

use std::env;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use fixdesk::backend::rest::RestBackend;
use fixdesk::backend::Backend;
use fixdesk::config::{arg_value, has_flag, Config};
use fixdesk::connectivity::HttpProbe;
use fixdesk::identity::{dashboard_navigation, filter_navigation, Access, RefreshOutcome, RoleResolver, SessionStore};

fn print_usage() {
    println!("fixdesk client\n\nUSAGE:\n  fixdesk_cli whoami [--email E --password P]\n  fixdesk_cli --watch [--email E --password P]\n\nOPTIONS:\n  --email E        Sign in as E (env: FIXDESK_EMAIL)\n  --password P     Password (env: FIXDESK_PASSWORD)\n  --backend-url U  Backend base URL (env: FIXDESK_BACKEND_URL)\n\nWithout credentials the session persisted in FIXDESK_SESSION_FILE is used.\n");
}

fn print_access(user: Option<&str>, access: &Access) {
    let role = access.role.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string());
    println!("user:  {}", user.unwrap_or("(signed out)"));
    println!("role:  {}", role);
    let grants: Vec<String> = access.permissions.iter().map(|p| format!("{}:{}", p.resource, p.action)).collect();
    println!("grants: {}", if grants.is_empty() { "(none)".to_string() } else { grants.join(", ") });
    for item in filter_navigation(&dashboard_navigation(), access) {
        println!("  {:<14} {}", item.label, item.href);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let args: Vec<String> = env::args().collect();
    let watch_mode = has_flag(&args, "--watch");
    if has_flag(&args, "--help") || has_flag(&args, "-h") || (!watch_mode && !has_flag(&args, "whoami")) {
        print_usage();
        return Ok(());
    }

    let cfg = Config::from_env()?.apply_args(&args)?;
    let backend = Arc::new(RestBackend::from_config(&cfg)?);
    let probe = Arc::new(HttpProbe::new(&cfg.probe_urls, cfg.probe_timeout));
    let store = Arc::new(
        SessionStore::new(backend.clone(), probe)
            .with_retry_policy(cfg.retry)
            .with_cache_window(cfg.session_cache),
    );
    let _events = store.listen();

    let email = arg_value(&args, "--email").or_else(|| env::var("FIXDESK_EMAIL").ok());
    let password = arg_value(&args, "--password").or_else(|| env::var("FIXDESK_PASSWORD").ok());
    if let (Some(email), Some(password)) = (email, password) {
        let session = backend.sign_in(&email, &password).await?;
        info!(target: "fixdesk::cli", "signed in as {}", session.user_id);
    }

    if let RefreshOutcome::Failed(e) = store.refresh().await {
        warn!(target: "fixdesk::cli", "could not load session, continuing signed out: {}", e);
    }
    let resolver = Arc::new(RoleResolver::new(backend.clone()));

    if !watch_mode {
        let session = store.get_session();
        let access = resolver.resolve(session.as_ref()).await?;
        print_access(session.as_ref().map(|s| s.user_id.as_str()), &access);
        return Ok(());
    }

    let _follow = resolver.follow(store.watch());
    let _refresh = store.spawn_refresh_loop(cfg.session_cache);
    let mut access_rx = resolver.watch();
    loop {
        tokio::select! {
            changed = access_rx.changed() => {
                if changed.is_err() { break; }
                let access = access_rx.borrow_and_update().clone();
                if access.loading { continue; }
                let session = store.get_session();
                println!("---");
                print_access(session.as_ref().map(|s| s.user_id.as_str()), &access);
            }
            _ = tokio::signal::ctrl_c() => {
                info!(target: "fixdesk::cli", "interrupted");
                break;
            }
        }
    }
    Ok(())
}
