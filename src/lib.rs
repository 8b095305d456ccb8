//! Gaia - web backend scaffold
//!
//! The core of the crate is [`http::ServerLifecycle`], which runs an axum router
//! over plain HTTP, static-certificate TLS or ACME-issued TLS, redirects HTTP to
//! HTTPS when TLS is active, and shuts down gracefully within a bound.

pub mod config;
pub mod error;
pub mod hooks;
pub mod http;
pub mod middleware;
pub mod routes;
pub mod state;

pub use error::*;
