//! Thin glue binary: loads configuration, constructs the engine with an
//! HTTP-fallback store adapter, and runs a retry scheduler around
//! `start()`.
//!
//! Initialises `tracing_subscriber` the way a server's `main.rs` binary
//! would; library code never does this itself.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use troparcel_core::config::Options;
use troparcel_core::engine::SyncEngine;
use troparcel_core::store::HttpFallbackAdapter;

const MAX_STARTUP_RETRIES: u32 = 5;
const HTTP_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = load_options();
    let profile_dir = profile_dir();

    let adapter = Arc::new(HttpFallbackAdapter::new(options.server_url.clone(), HTTP_POLL_INTERVAL));

    let mut attempt = 0u32;
    loop {
        let mut engine = match SyncEngine::new(options.clone(), adapter.clone(), profile_dir.clone()).await {
            Ok(engine) => engine,
            Err(e) => {
                tracing::error!(error = %e, "fatal startup error constructing engine");
                if !retry_or_give_up(&mut attempt).await {
                    return;
                }
                continue;
            }
        };

        match engine.start().await {
            Ok(()) => {
                tracing::info!("sync engine started");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "fatal startup error starting engine");
                if !retry_or_give_up(&mut attempt).await {
                    return;
                }
            }
        }
    }

    // Park the binary; the engine's spawned tasks keep running.
    std::future::pending::<()>().await;
}

/// Re-invoke construction/start with exponential back-off on a fatal
/// startup error. Returns `false` once the retry budget is exhausted —
/// the plugin then falls back to manual-only mode (i.e. exits, leaving
/// the host to retry the whole process later).
async fn retry_or_give_up(attempt: &mut u32) -> bool {
    *attempt += 1;
    if *attempt > MAX_STARTUP_RETRIES {
        tracing::error!("exceeded startup retry budget, falling back to manual-only mode");
        return false;
    }
    let delay = Duration::from_secs(2u64.saturating_pow(*attempt).min(60));
    tracing::warn!(attempt, delay_secs = delay.as_secs(), "retrying startup");
    tokio::time::sleep(delay).await;
    true
}

fn load_options() -> Options {
    let path = std::env::args().nth(1);
    match path {
        Some(path) => match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(options) => options,
                Err(e) => {
                    tracing::warn!(error = %e, path, "failed to parse config file, using defaults");
                    Options::default()
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, path, "failed to read config file, using defaults");
                Options::default()
            }
        },
        None => Options::default(),
    }
}

fn profile_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("troparcel")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retry_budget_is_exhausted_eventually() {
        let mut attempt = 0u32;
        let mut allowed = 0u32;
        while retry_or_give_up(&mut attempt).await {
            allowed += 1;
            if allowed > MAX_STARTUP_RETRIES + 1 {
                panic!("retry loop did not terminate");
            }
        }
        assert_eq!(allowed, MAX_STARTUP_RETRIES);
    }
}
