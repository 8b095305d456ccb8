//! HTTP/HTTPS server lifecycle.
//!
//! Supports three listener modes:
//! - Plain: one HTTP listener serving the application
//! - TLS: user-provided certificate files, plus an HTTP->HTTPS redirect listener
//! - AutoTLS: automatic Let's Encrypt certificates, plus the redirect listener
//!
//! Every listener runs as its own task. The tasks are joined as a group: the first
//! one to fail cancels the others, and `serve` only returns once all of them (and
//! the shutdown watcher) have finished.

use std::future::Future;
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;

use axum::http::StatusCode;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use futures::future::BoxFuture;
use futures::StreamExt;
use hyper_util::rt::TokioTimer;
use rustls_acme::caches::DirCache;
use rustls_acme::{AcmeConfig, UseChallenge};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;

use crate::config::{ConfigError, ListenerMode, Mode, ServerConfig};
use crate::hooks::{BoxError, HookError, LifecycleHooks};

use super::redirect;
use super::shutdown;

/// Server lifecycle error
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Invalid server configuration: {0}")]
    Configuration(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("{listener} listener failed: {source}")]
    Listener {
        listener: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Graceful shutdown did not finish within {0:?}")]
    ShutdownTimeout(Duration),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error("Server task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<ConfigError> for ServerError {
    fn from(e: ConfigError) -> Self {
        ServerError::Configuration(e.to_string())
    }
}

/// Addresses of a running server.
///
/// Obtained from [`ServerLifecycle::handle`] before calling `serve`. The address
/// futures resolve once the corresponding listener is accepting connections.
#[derive(Clone, Debug)]
pub struct ServerHandle {
    app: Handle,
    redirect: Option<Handle>,
}

impl ServerHandle {
    /// Address of the listener serving the application (the TLS listener in TLS modes).
    pub async fn app_addr(&self) -> Option<SocketAddr> {
        self.app.listening().await
    }

    /// Address of the HTTP->HTTPS redirect listener. `None` in plain mode.
    pub async fn redirect_addr(&self) -> Option<SocketAddr> {
        match &self.redirect {
            Some(handle) => handle.listening().await,
            None => None,
        }
    }
}

/// One listener task in the group.
struct Listener {
    name: &'static str,
    handle: Handle,
    serve: BoxFuture<'static, std::io::Result<()>>,
}

impl Listener {
    fn new<F>(name: &'static str, handle: Handle, serve: F) -> Self
    where
        F: Future<Output = std::io::Result<()>> + Send + 'static,
    {
        Self {
            name,
            handle,
            serve: Box::pin(serve),
        }
    }
}

/// Owns the application router and runs it under the configured listener mode.
///
/// `serve` consumes the lifecycle, so a server can only be started once.
pub struct ServerLifecycle {
    app: Router,
    config: ServerConfig,
    hooks: LifecycleHooks,
    handle: ServerHandle,
    shutdown_timeout: Duration,
}

impl ServerLifecycle {
    pub fn new(app: Router, config: ServerConfig) -> Self {
        let write_timeout = config.write_timeout();
        let app = if write_timeout.is_zero() {
            app
        } else {
            app.layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                write_timeout,
            ))
        };

        let redirect = (config.tls_enabled() || config.auto_tls_enabled()).then(Handle::new);

        Self {
            app,
            shutdown_timeout: config.shutdown_timeout(),
            config,
            hooks: LifecycleHooks::new(),
            handle: ServerHandle {
                app: Handle::new(),
                redirect,
            },
        }
    }

    /// Override the graceful shutdown bound from the configuration.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn before_start<F>(mut self, hook: F) -> Self
    where
        F: FnMut() -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.hooks.add_before_start(hook);
        self
    }

    pub fn after_stop<F>(mut self, hook: F) -> Self
    where
        F: FnMut() -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.hooks.add_after_stop(hook);
        self
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Run the server until `shutdown` is cancelled or a listener fails.
    ///
    /// Configuration errors and failing before-start hooks return before any
    /// listener is bound. Once startup has been attempted, after-stop hooks run
    /// regardless of the outcome.
    pub async fn serve(mut self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let tls = match self.config.listener_mode()? {
            ListenerMode::Plain => None,
            ListenerMode::Tls(_) => Some(false),
            ListenerMode::AutoTls(_) => Some(true),
        };

        self.hooks.run_before_start()?;

        let result = match tls {
            None => self.run(shutdown).await,
            Some(false) => self.run_tls(shutdown).await,
            Some(true) => self.run_auto_tls(shutdown).await,
        };

        match &result {
            Ok(()) => tracing::info!("Server stopped"),
            Err(e) => tracing::error!(error = %e, "Server stopped with an error"),
        }

        self.hooks.run_after_stop();
        result
    }

    /// Serve the application over plain HTTP on `host:port`.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let addr = self.resolve(self.config.port).await?;
        let listener = bind(addr)?;

        if self.config.mode == Mode::Prod {
            tracing::warn!(
                "TLS disabled - server running on plain HTTP (not recommended for production)"
            );
        }
        tracing::info!(%addr, mode = self.config.mode.as_str(), "Starting HTTP server (no TLS)");

        let app_handle = self.handle.app.clone();
        let mut server = axum_server::from_tcp(listener).handle(app_handle.clone());
        self.configure_http(&mut server);

        let listeners = vec![Listener::new(
            "http",
            app_handle,
            server.serve(self.app.clone().into_make_service()),
        )];

        self.supervise(listeners, shutdown.child_token(), Vec::new()).await
    }

    /// Serve the application over HTTPS with certificate files, redirecting HTTP.
    pub async fn run_tls(&self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let ListenerMode::Tls(tls) = self.config.listener_mode()? else {
            return Err(ServerError::Configuration("http.tls is not enabled".to_string()));
        };

        install_crypto_provider();
        let rustls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
            .await
            .map_err(|e| {
                ServerError::Configuration(format!(
                    "Failed to load certificates from '{}' and '{}': {}",
                    tls.cert_path, tls.key_path, e
                ))
            })?;

        let redirect_addr = self.resolve(self.config.port).await?;
        let tls_addr = self.resolve(tls.port).await?;
        let redirect_listener = bind(redirect_addr)?;
        let tls_listener = bind(tls_addr)?;
        let https_port = tls.public_port.unwrap_or_else(|| bound_port(&tls_listener, tls_addr));

        tracing::info!(
            %redirect_addr,
            %tls_addr,
            cert = %tls.cert_path,
            key = %tls.key_path,
            "Starting HTTPS server (manual certs)"
        );

        let group = shutdown.child_token();
        let reload = shutdown::spawn_reload_handler(
            rustls_config.clone(),
            tls.cert_path.clone(),
            tls.key_path.clone(),
            group.clone(),
        );

        let redirect_handle = self.redirect_handle();
        let mut redirect_server =
            axum_server::from_tcp(redirect_listener).handle(redirect_handle.clone());
        self.configure_http(&mut redirect_server);

        let app_handle = self.handle.app.clone();
        let mut tls_server = axum_server::tls_rustls::from_tcp_rustls(tls_listener, rustls_config)
            .handle(app_handle.clone());
        self.configure_http(&mut tls_server);

        let listeners = vec![
            Listener::new(
                "redirect",
                redirect_handle,
                redirect_server.serve(redirect::router(https_port).into_make_service()),
            ),
            Listener::new(
                "https",
                app_handle,
                tls_server.serve(self.app.clone().into_make_service()),
            ),
        ];

        self.supervise(listeners, group, vec![reload]).await
    }

    /// Serve the application over HTTPS with ACME certificates, redirecting HTTP.
    ///
    /// Certificates are validated with the HTTP-01 challenge: the redirect listener
    /// answers challenge tokens and redirects everything else.
    pub async fn run_auto_tls(&self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let ListenerMode::AutoTls(auto) = self.config.listener_mode()? else {
            return Err(ServerError::Configuration("http.auto_tls is not enabled".to_string()));
        };

        std::fs::create_dir_all(&auto.cache_dir).map_err(|e| {
            ServerError::Configuration(format!(
                "Failed to create ACME cache directory '{}': {}",
                auto.cache_dir, e
            ))
        })?;

        let redirect_addr = self.resolve(self.config.port).await?;
        let tls_addr = self.resolve(auto.port).await?;
        let redirect_listener = bind(redirect_addr)?;
        let tls_listener = bind(tls_addr)?;
        let https_port = auto.public_port.unwrap_or_else(|| bound_port(&tls_listener, tls_addr));

        let env_name = if auto.production { "production" } else { "staging" };
        tracing::info!(
            %redirect_addr,
            %tls_addr,
            hosts = ?auto.hosts,
            cache = %auto.cache_dir,
            environment = %env_name,
            "Starting HTTPS server (ACME)"
        );

        if !auto.production {
            tracing::warn!(
                "Using Let's Encrypt staging environment - certificates will NOT be trusted by browsers. \
                 Set production = true for production use."
            );
        }

        install_crypto_provider();
        let mut acme_config = AcmeConfig::new(auto.hosts.clone())
            .cache(DirCache::new(auto.cache_dir.clone()))
            .directory_lets_encrypt(auto.production)
            .challenge_type(UseChallenge::Http01);
        if let Some(email) = &auto.email {
            acme_config = acme_config.contact_push(format!("mailto:{}", email));
        }
        let mut acme_state = acme_config.state();
        let acceptor = acme_state.axum_acceptor(acme_state.default_rustls_config());
        let challenges = acme_state.http01_challenge_tower_service();

        let group = shutdown.child_token();

        // Drives issuance and renewal until the group shuts down
        let driver_token = group.clone();
        let acme_driver = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = driver_token.cancelled() => break,
                    event = acme_state.next() => match event {
                        Some(Ok(event)) => {
                            tracing::info!(event = ?event, "ACME event");
                        }
                        Some(Err(err)) => {
                            tracing::error!(error = %err, "ACME error");
                        }
                        None => {
                            tracing::debug!("ACME state stream ended");
                            break;
                        }
                    }
                }
            }
        });

        let redirect_handle = self.redirect_handle();
        let mut redirect_server =
            axum_server::from_tcp(redirect_listener).handle(redirect_handle.clone());
        self.configure_http(&mut redirect_server);

        let app_handle = self.handle.app.clone();
        let mut tls_server = axum_server::from_tcp(tls_listener)
            .acceptor(acceptor)
            .handle(app_handle.clone());
        self.configure_http(&mut tls_server);

        let listeners = vec![
            Listener::new(
                "redirect",
                redirect_handle,
                redirect_server.serve(
                    redirect::router(https_port)
                        .route_service(redirect::ACME_CHALLENGE_PATH, challenges)
                        .into_make_service(),
                ),
            ),
            Listener::new(
                "https",
                app_handle,
                tls_server.serve(self.app.clone().into_make_service()),
            ),
        ];

        self.supervise(listeners, group, vec![acme_driver]).await
    }

    /// Run listener tasks until the group is cancelled or one of them stops.
    ///
    /// `companions` are auxiliary tasks tied to `group`; they are awaited after the
    /// listeners so nothing outlives this call.
    async fn supervise(
        &self,
        listeners: Vec<Listener>,
        group: CancellationToken,
        companions: Vec<JoinHandle<()>>,
    ) -> Result<(), ServerError> {
        let drained = CancellationToken::new();
        let handles = listeners.iter().map(|l| l.handle.clone()).collect();
        let watcher = tokio::spawn(shutdown::watch_shutdown(
            group.clone(),
            drained.clone(),
            handles,
            self.shutdown_timeout,
        ));

        let mut tasks = JoinSet::new();
        for listener in listeners {
            let name = listener.name;
            tasks.spawn(async move {
                let result = listener.serve.await;
                tracing::debug!(listener = name, "Listener stopped");
                result.map_err(|source| ServerError::Listener {
                    listener: name,
                    source,
                })
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(ServerError::from).and_then(|r| r);
            if let Err(e) = result {
                tracing::error!(error = %e, "Listener failed, shutting down the remaining listeners");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            // A listener only returns on its own when it failed or was shut down;
            // either way the rest of the group follows.
            group.cancel();
        }

        drained.cancel();
        let shutdown_result = watcher.await.map_err(ServerError::from).and_then(|r| r);

        for companion in companions {
            if let Err(e) = companion.await {
                tracing::warn!(error = %e, "Companion task failed");
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => shutdown_result,
        }
    }

    fn configure_http<A>(&self, server: &mut axum_server::Server<A>) {
        // Read and idle timeouts both bound how long a connection may wait for headers
        let header_timeout = self.config.read_timeout().max(self.config.idle_timeout());
        if !header_timeout.is_zero() {
            server
                .http_builder()
                .http1()
                .timer(TokioTimer::new())
                .header_read_timeout(header_timeout);
        }
    }

    fn redirect_handle(&self) -> Handle {
        self.handle.redirect.clone().unwrap_or_else(Handle::new)
    }

    async fn resolve(&self, port: u16) -> Result<SocketAddr, ServerError> {
        let host = self.config.host.as_str();
        tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| ServerError::Configuration(format!("Invalid http.host '{}': {}", host, e)))?
            .next()
            .ok_or_else(|| {
                ServerError::Configuration(format!("http.host '{}' did not resolve", host))
            })
    }
}

fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let listener = TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
    listener
        .set_nonblocking(true)
        .map_err(|source| ServerError::Bind { addr, source })?;
    Ok(listener)
}

fn bound_port(listener: &TcpListener, requested: SocketAddr) -> u16 {
    listener
        .local_addr()
        .map(|addr| addr.port())
        .unwrap_or(requested.port())
}

/// Select aws-lc-rs as the process-wide rustls provider.
///
/// Other dependencies may enable a second provider, in which case rustls cannot
/// choose one on its own.
fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
