//! Graceful shutdown and signal handling.
//!
//! Handles:
//! - SIGTERM/SIGINT: cancel the server's shutdown token
//! - Shutdown watcher: drain listeners within a bound, then force-close
//! - SIGHUP: Certificate reload (static TLS mode only)

use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio_util::sync::CancellationToken;

use super::server::ServerError;

/// Cancel `token` on SIGTERM or SIGINT.
///
/// The returned task ends when either a signal arrives or the token is cancelled
/// by someone else.
pub fn spawn_signal_handler(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = token.cancelled() => return,
        }

        token.cancel();
    })
}

/// Translate cancellation of `group` into a bounded graceful shutdown.
///
/// Every handle stops accepting and in-flight requests may finish. `drained` is
/// cancelled by the supervisor once all listener tasks have returned; if that does
/// not happen within `grace`, all connections are closed and `ShutdownTimeout` is
/// returned.
pub async fn watch_shutdown(
    group: CancellationToken,
    drained: CancellationToken,
    handles: Vec<Handle>,
    grace: Duration,
) -> Result<(), ServerError> {
    group.cancelled().await;

    for handle in &handles {
        handle.graceful_shutdown(None);
    }

    if drained.is_cancelled() {
        return Ok(());
    }

    tracing::info!(
        grace_ms = grace.as_millis() as u64,
        "Graceful shutdown initiated, waiting for connections to close"
    );

    tokio::select! {
        _ = drained.cancelled() => {
            tracing::info!("All listeners drained");
            Ok(())
        }
        _ = tokio::time::sleep(grace) => {
            let open: usize = handles.iter().map(Handle::connection_count).sum();
            tracing::warn!(
                open_connections = open,
                "Graceful shutdown timed out, closing remaining connections"
            );
            for handle in &handles {
                handle.shutdown();
            }
            Err(ServerError::ShutdownTimeout(grace))
        }
    }
}

/// Reload the certificate and key on SIGHUP until `token` is cancelled.
#[cfg(unix)]
pub fn spawn_reload_handler(
    tls_config: RustlsConfig,
    cert_path: String,
    key_path: String,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sighup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(sighup) => sighup,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGHUP handler");
                    return;
                }
            };

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sighup.recv() => {}
            }
            tracing::info!("Received SIGHUP, reloading TLS certificates");

            match tls_config.reload_from_pem_file(&cert_path, &key_path).await {
                Ok(()) => {
                    tracing::info!(cert = %cert_path, key = %key_path, "TLS certificates reloaded successfully");
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        cert = %cert_path,
                        key = %key_path,
                        "Failed to reload TLS certificates"
                    );
                }
            }
        }
    })
}

/// No-op reload handler for non-Unix platforms.
#[cfg(not(unix))]
pub fn spawn_reload_handler(
    _tls_config: RustlsConfig,
    _cert_path: String,
    _key_path: String,
    _token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tracing::warn!("Certificate hot-reload via SIGHUP not supported on this platform");
    tokio::spawn(async {})
}
