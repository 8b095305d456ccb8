//! Request correlation.
//!
//! Every request runs inside a `request` span carrying a UUID. An id supplied by
//! a fronting proxy in `X-Request-Id` is kept when it is a valid UUID, otherwise
//! a fresh v4 id is generated. The id is returned in the same response header.

use std::time::Instant;

use axum::{
    extract::Request,
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;
use uuid::Uuid;

pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Request id, available to handlers as an extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Reuse a well-formed upstream id, or generate one.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let upstream = headers
            .get(&X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v.trim()).ok());
        Self(upstream.unwrap_or_else(Uuid::new_v4))
    }

    fn header_value(&self) -> HeaderValue {
        HeaderValue::from_str(&self.0.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("invalid"))
    }
}

/// Outermost layer: wraps the request in a span and tags the response.
pub async fn request_id_layer(mut request: Request, next: Next) -> Response {
    let id = RequestId::from_headers(request.headers());
    let span = tracing::info_span!(
        "request",
        request_id = %id.0,
        method = %request.method(),
        path = %request.uri().path(),
        status = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    );
    request.extensions_mut().insert(id);

    async move {
        let start = Instant::now();
        let mut response = next.run(request).await;
        let status = response.status();
        let duration_ms = start.elapsed().as_millis() as u64;

        let span = tracing::Span::current();
        span.record("status", status.as_u16());
        span.record("duration_ms", duration_ms);
        if status.is_server_error() {
            tracing::warn!("Request failed");
        } else {
            tracing::info!("Request completed");
        }

        response.headers_mut().insert(X_REQUEST_ID.clone(), id.header_value());
        response
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_uuid_is_kept() {
        let upstream = "6f1c3b52-0c7e-4a8e-9d55-2f3e9a1b7c40";
        let mut headers = HeaderMap::new();
        headers.insert(X_REQUEST_ID.clone(), HeaderValue::from_static(upstream));

        let id = RequestId::from_headers(&headers);
        assert_eq!(id.0.to_string(), upstream);
        assert_eq!(id.header_value(), upstream);
    }

    #[test]
    fn test_malformed_upstream_id_is_replaced() {
        let mut headers = HeaderMap::new();
        headers.insert(X_REQUEST_ID.clone(), HeaderValue::from_static("abc; drop table"));

        let id = RequestId::from_headers(&headers);
        assert_eq!(id.0.get_version_num(), 4);
    }

    #[test]
    fn test_missing_header_generates_fresh_ids() {
        let headers = HeaderMap::new();
        assert_ne!(RequestId::from_headers(&headers), RequestId::from_headers(&headers));
    }
}
