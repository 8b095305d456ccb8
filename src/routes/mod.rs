//! HTTP route handlers.
//!
//! The router is the application the server lifecycle runs. It is deliberately
//! small: a welcome endpoint, the liveness probe and a JSON 404 fallback.
//!
//! Cross-cutting HTTP behavior lives here as middleware rather than in the
//! server: request IDs, CORS, and no-cache/security response headers.

pub mod health;

use axum::{
    extract::State,
    http::header::{
        self, HeaderName, HeaderValue, CACHE_CONTROL, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS,
    },
    http::Method,
    middleware,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::config::HEALTH_PATH;
use crate::error::AppError;
use crate::middleware::request_id_layer;
use crate::state::AppState;

/// Root handler.
async fn index(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "text": "Welcome to api app.",
        "mode": state.config.http.mode.as_str(),
        "version": state.version,
    }))
}

async fn not_found() -> AppError {
    AppError::NotFound
}

/// CORS policy: any origin, the usual REST methods and headers.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::DELETE,
            Method::POST,
            Method::OPTIONS,
            Method::GET,
            Method::PUT,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::CONTENT_LENGTH,
            header::ACCEPT_ENCODING,
            HeaderName::from_static("x-csrf-token"),
            header::AUTHORIZATION,
            header::ACCEPT,
            header::ORIGIN,
            header::CACHE_CONTROL,
            HeaderName::from_static("x-requested-with"),
        ])
}

/// Creates the Axum router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route(HEALTH_PATH, get(health::health))
        .fallback(not_found)
        .with_state(state)
        .layer(SetResponseHeaderLayer::if_not_present(
            CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-store, max-age=0, must-revalidate"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        // Request ID middleware - creates root span with request_id for correlation
        .layer(middleware::from_fn(request_id_layer))
}
