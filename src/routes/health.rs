//! Health check endpoint and startup probe.
//!
//! The endpoint is a liveness probe that returns 200 OK when the process is running.
//! [`wait_until_healthy`] is the client side: it polls the endpoint after startup
//! until the router answers. [`probe_server`] points it at a lifecycle's listener.

use std::net::SocketAddr;
use std::time::Duration;

use crate::config::HEALTH_PATH;
use crate::http::ServerHandle;

/// Health check handler.
pub async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("{url} did not become healthy after {attempts} attempts")]
    Unreachable { url: String, attempts: u32 },

    #[error("Server was not listening within {0:?}")]
    NotListening(Duration),
}

/// Probe the health endpoint of the server behind `handle`.
///
/// Waits for the application listener for at most `max_attempts * interval`, so a
/// server that never binds does not keep the probe alive.
pub async fn probe_server(
    handle: &ServerHandle,
    secure: bool,
    max_attempts: u32,
    interval: Duration,
) -> Result<(), HealthError> {
    let bound = interval * max_attempts.max(1);
    let addr = match tokio::time::timeout(bound, handle.app_addr()).await {
        Ok(Some(addr)) => addr,
        _ => return Err(HealthError::NotListening(bound)),
    };

    wait_until_healthy(&health_url(addr, secure), max_attempts, interval).await
}

fn health_url(addr: SocketAddr, secure: bool) -> String {
    let scheme = if secure { "https" } else { "http" };
    let ip = if addr.ip().is_unspecified() {
        "127.0.0.1".to_string()
    } else if addr.is_ipv6() {
        format!("[{}]", addr.ip())
    } else {
        addr.ip().to_string()
    };
    format!("{}://{}:{}{}", scheme, ip, addr.port(), HEALTH_PATH)
}

/// Poll `url` until it answers 200 OK, at most `max_attempts` times.
pub async fn wait_until_healthy(
    url: &str,
    max_attempts: u32,
    interval: Duration,
) -> Result<(), HealthError> {
    let client = reqwest::Client::builder()
        .timeout(interval.max(Duration::from_millis(100)))
        .danger_accept_invalid_certs(true)
        .build()?;

    for attempt in 1..=max_attempts {
        match client.get(url).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                tracing::info!(%url, attempt, "Router is healthy");
                return Ok(());
            }
            Ok(resp) => {
                tracing::debug!(%url, attempt, status = resp.status().as_u16(), "Health probe failed");
            }
            Err(e) => {
                tracing::debug!(%url, attempt, error = %e, "Health probe failed");
            }
        }

        if attempt < max_attempts {
            tracing::info!(%url, "Waiting for the router, retrying in {:?}", interval);
            tokio::time::sleep(interval).await;
        }
    }

    Err(HealthError::Unreachable {
        url: url.to_string(),
        attempts: max_attempts,
    })
}
