//! HTTP server module with TLS support.
//!
//! This module provides the server lifecycle with three listener modes:
//! - **Plain**: HTTP only (development, or behind a TLS-terminating proxy)
//! - **TLS**: User-provided certificate and key files
//! - **AutoTLS**: Automatic certificate provisioning via Let's Encrypt
//!
//! The server includes:
//! - HTTP to HTTPS redirect (when TLS enabled)
//! - Bounded graceful shutdown on cancellation, SIGTERM or SIGINT
//! - Certificate hot-reload via SIGHUP (TLS mode)

pub mod redirect;
mod server;
pub mod shutdown;

pub use server::{ServerError, ServerHandle, ServerLifecycle};
