//! HTTP to HTTPS redirect.
//!
//! The redirect listener runs next to the TLS listener and answers every request
//! with a permanent redirect to the same host, path and query over HTTPS. In
//! AutoTLS mode the ACME challenge route is mounted on top of it.

use axum::body::Body;
use axum::http::header::{HOST, LOCATION, STRICT_TRANSPORT_SECURITY};
use axum::http::{HeaderValue, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;

use crate::config::{DEFAULT_HTTPS_PORT, STRICT_TRANSPORT_SECURITY as HSTS};
use crate::error::AppError;

/// Route of ACME HTTP-01 challenge tokens on the redirect listener.
pub const ACME_CHALLENGE_PATH: &str = "/.well-known/acme-challenge/{token}";

/// Router that redirects every request to `https_port`.
pub fn router(https_port: u16) -> Router {
    Router::new().fallback(move |request: Request<Body>| async move {
        redirect(&request, https_port)
    })
}

/// Map a plain HTTP request to its HTTPS redirect.
///
/// The host comes from the request target when it is in absolute form, otherwise
/// from the `Host` header. Any port on the host is replaced by `https_port`, which
/// is omitted when it is the default HTTPS port.
pub fn redirect<B>(request: &Request<B>, https_port: u16) -> Response {
    let host = request.uri().host().map(str::to_string).or_else(|| {
        request
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
    });

    let Some(host) = host.filter(|h| !h.is_empty()) else {
        return AppError::BadRequest("missing Host header".to_string()).into_response();
    };

    let location = https_location(&host, request.uri(), https_port);
    let Ok(location) = HeaderValue::from_str(&location) else {
        return AppError::BadRequest(format!("invalid Host header '{}'", host)).into_response();
    };

    tracing::debug!(from = %request.uri(), to = ?location, "Redirecting HTTP to HTTPS");

    (
        StatusCode::MOVED_PERMANENTLY,
        [
            (LOCATION, location),
            (STRICT_TRANSPORT_SECURITY, HeaderValue::from_static(HSTS)),
        ],
    )
        .into_response()
}

/// Build the HTTPS URL for `host` and the path and query of `uri`.
pub fn https_location(host: &str, uri: &Uri, https_port: u16) -> String {
    let host = strip_port(host);
    let path_and_query = match uri.path_and_query().map(|pq| pq.as_str()) {
        Some(pq) if !pq.is_empty() => pq,
        _ => "/",
    };

    if https_port == DEFAULT_HTTPS_PORT {
        format!("https://{}{}", host, path_and_query)
    } else {
        format!("https://{}:{}{}", host, https_port, path_and_query)
    }
}

fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 literal, e.g. "[::1]:8080"
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    host.split(':').next().unwrap_or(host)
}
