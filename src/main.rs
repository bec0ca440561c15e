//!
//! fixdesk server binary
//! ---------------------
//! Command-line entry point for the dashboard HTTP server. Configuration comes
//! from `FIXDESK_*` environment variables with CLI flags taking precedence.

use std::env;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use fixdesk::config::{has_flag, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let _ = fmt().with_env_filter(filter).try_init();

    let args: Vec<String> = env::args().collect();
    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("fixdesk Server\n\nUSAGE:\n  fixdesk [--http-port N] [--backend-url URL]\n\nOPTIONS:\n  --http-port N        HTTP port (env: FIXDESK_HTTP_PORT, default 3000)\n  --backend-url URL    Backend base URL (env: FIXDESK_BACKEND_URL, required)\n\nENVIRONMENT:\n  FIXDESK_BACKEND_KEY  Backend API key (required)\n  RUST_LOG             Log filter (default info)\n");
        return Ok(());
    }

    let config = Config::from_env()?.apply_args(&args)?;
    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "fixdesk",
        "fixdesk starting: RUST_LOG='{}', http_port={}, backend='{}', buckets={:?}",
        rust_log, config.http_port, config.backend_url, config.storage_buckets
    );

    fixdesk::server::run(config).await
}
