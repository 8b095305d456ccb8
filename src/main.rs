//! Gaia: a web backend scaffold.
//!
//! This is the application entry point. It initializes tracing, loads configuration
//! from a TOML file, builds the Axum router, and runs it under the server lifecycle
//! until SIGINT/SIGTERM.

use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gaia::config::{AppConfig, DEFAULT_CONFIG_PATH, HEALTH_PROBE_INTERVAL_SECS};
use gaia::http::{shutdown, ServerLifecycle};
use gaia::routes::{create_router, health};
use gaia::state::AppState;

/// Gaia: a web backend scaffold
#[derive(Parser, Debug)]
#[command(name = "gaia", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "GAIA_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level filter (e.g., "gaia=debug,tower_http=info")
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = AppConfig::load(&args.config)?;

    // Initialize tracing with priority: CLI > env > config > mode default
    let log_filter = args
        .log_level
        .or_else(|| std::env::var("RUST_LOG").ok())
        .or_else(|| config.logging.level.clone())
        .unwrap_or_else(|| config.http.mode.default_log_filter().to_string());

    let registry =
        tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(&log_filter));
    if config.logging.is_json() {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!(
        config = %args.config,
        mode = config.http.mode.as_str(),
        host = %config.http.host,
        port = config.http.port,
        tls = config.http.tls_enabled(),
        auto_tls = config.http.auto_tls_enabled(),
        "Loaded configuration"
    );

    let server_config = config.http.clone();
    let max_ping_count = server_config.max_ping_count;
    let secure = server_config.tls_enabled() || server_config.auto_tls_enabled();

    let state = AppState::new(config);
    let app = create_router(state);

    let lifecycle = ServerLifecycle::new(app, server_config)
        .before_start(|| {
            tracing::info!("Starting server");
            Ok(())
        })
        .after_stop(|| {
            tracing::info!("Server shut down, exiting");
            Ok(())
        });

    let token = CancellationToken::new();
    let signals = shutdown::spawn_signal_handler(token.clone());

    let probe = (max_ping_count > 0).then(|| {
        let handle = lifecycle.handle();
        let interval = Duration::from_secs(HEALTH_PROBE_INTERVAL_SECS);
        tokio::spawn(async move {
            if let Err(e) = health::probe_server(&handle, secure, max_ping_count, interval).await {
                tracing::error!(error = %e, "Health probe failed");
            }
        })
    });

    let result = lifecycle.serve(token.clone()).await;

    if let Some(probe) = probe {
        probe.abort();
    }
    token.cancel();
    let _ = signals.await;

    result?;
    Ok(())
}
