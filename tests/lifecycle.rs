//! End-to-end tests for the server lifecycle.
//!
//! Every test binds to 127.0.0.1 with port 0 (or a port known to be free) and reads
//! the bound addresses back from the `ServerHandle`.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::Uri;
use axum::routing::get;
use axum::Router;
use gaia::config::{AutoTlsConfig, ServerConfig, TlsConfig};
use gaia::http::{ServerError, ServerLifecycle};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn fixture(name: &str) -> String {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
        .to_string_lossy()
        .into_owned()
}

/// A port nothing is listening on.
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn is_listening(addr: SocketAddr) -> bool {
    TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok()
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap()
}

fn app() -> Router {
    Router::new()
        .route("/", get(|| async { "root" }))
        .route("/echo", get(|uri: Uri| async move { uri.to_string() }))
}

fn tls_config(port: u16, public_port: Option<u16>) -> ServerConfig {
    let mut config = ServerConfig::plain("127.0.0.1", port);
    config.tls = Some(TlsConfig {
        enabled: true,
        port: 0,
        cert_path: fixture("localhost.pem"),
        key_path: fixture("localhost.key"),
        public_port,
    });
    config
}

async fn stop(
    token: CancellationToken,
    server: tokio::task::JoinHandle<Result<(), ServerError>>,
) -> Result<(), ServerError> {
    token.cancel();
    tokio::time::timeout(TEST_TIMEOUT, server)
        .await
        .expect("serve should return after cancellation")
        .expect("serve task should not panic")
}

mod plain {
    use super::*;

    #[tokio::test]
    async fn test_request_reaches_handler_unmodified() {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();

        let lifecycle = ServerLifecycle::new(app(), ServerConfig::plain("127.0.0.1", 0))
            .after_stop(move || {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            });
        let handle = lifecycle.handle();
        let token = CancellationToken::new();
        let server = tokio::spawn(lifecycle.serve(token.clone()));

        let addr = handle.app_addr().await.expect("listener should start");
        assert!(handle.redirect_addr().await.is_none());

        let body = client()
            .get(format!("http://{}/", addr))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "root");

        let body = client()
            .get(format!("http://{}/echo?x=1&y=two", addr))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "/echo?x=1&y=two");

        assert!(!stopped.load(Ordering::SeqCst));
        stop(token, server).await.unwrap();

        assert!(stopped.load(Ordering::SeqCst), "after-stop hook should run");
        assert!(!is_listening(addr), "listener should be closed once serve returns");
    }

    #[tokio::test]
    async fn test_before_start_hooks_run_in_order_before_bind() {
        let order = Arc::new(AtomicUsize::new(0));
        let first = order.clone();
        let second = order.clone();

        let lifecycle = ServerLifecycle::new(app(), ServerConfig::plain("127.0.0.1", 0))
            .before_start(move || {
                assert_eq!(first.fetch_add(1, Ordering::SeqCst), 0);
                Ok(())
            })
            .before_start(move || {
                assert_eq!(second.fetch_add(1, Ordering::SeqCst), 1);
                Ok(())
            });
        let handle = lifecycle.handle();
        let token = CancellationToken::new();
        let server = tokio::spawn(lifecycle.serve(token.clone()));

        handle.app_addr().await.expect("listener should start");
        assert_eq!(order.load(Ordering::SeqCst), 2);

        stop(token, server).await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_before_start_hook_opens_no_listener() {
        let port = free_port();
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();

        let lifecycle = ServerLifecycle::new(app(), ServerConfig::plain("127.0.0.1", port))
            .before_start(|| Err("migrations failed".into()))
            .after_stop(move || {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            });

        let err = lifecycle.serve(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, ServerError::Hook(ref e) if e.index == 0));
        assert!(err.to_string().contains("migrations failed"));
        assert!(!is_listening(SocketAddr::from(([127, 0, 0, 1], port))));
        assert!(!stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_port_in_use_is_bind_error() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();

        let lifecycle = ServerLifecycle::new(app(), ServerConfig::plain("127.0.0.1", port))
            .after_stop(move || {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            });

        let err = lifecycle.serve(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ServerError::Bind { addr, .. } if addr.port() == port));
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_after_stop_hook_errors_are_not_propagated() {
        let lifecycle = ServerLifecycle::new(app(), ServerConfig::plain("127.0.0.1", 0))
            .after_stop(|| Err("flush failed".into()));
        let handle = lifecycle.handle();
        let token = CancellationToken::new();
        let server = tokio::spawn(lifecycle.serve(token.clone()));

        handle.app_addr().await.expect("listener should start");
        stop(token, server).await.unwrap();
    }
}

mod shutdown {
    use super::*;

    fn slow_app(entered: Arc<Notify>, delay: Duration) -> Router {
        Router::new().route(
            "/slow",
            get(move || {
                let entered = entered.clone();
                async move {
                    entered.notify_one();
                    tokio::time::sleep(delay).await;
                    "done"
                }
            }),
        )
    }

    #[tokio::test]
    async fn test_in_flight_request_completes_during_graceful_shutdown() {
        let entered = Arc::new(Notify::new());
        let lifecycle = ServerLifecycle::new(
            slow_app(entered.clone(), Duration::from_millis(300)),
            ServerConfig::plain("127.0.0.1", 0),
        )
        .with_shutdown_timeout(Duration::from_secs(5));
        let handle = lifecycle.handle();
        let token = CancellationToken::new();
        let server = tokio::spawn(lifecycle.serve(token.clone()));

        let addr = handle.app_addr().await.expect("listener should start");
        let request = tokio::spawn(async move {
            client()
                .get(format!("http://{}/slow", addr))
                .send()
                .await?
                .text()
                .await
        });

        entered.notified().await;
        stop(token, server).await.unwrap();

        let body = request.await.unwrap().unwrap();
        assert_eq!(body, "done");
        assert!(!is_listening(addr));
    }

    #[tokio::test]
    async fn test_shutdown_exceeding_bound_is_reported() {
        let entered = Arc::new(Notify::new());
        let grace = Duration::from_millis(200);
        let lifecycle = ServerLifecycle::new(
            slow_app(entered.clone(), Duration::from_secs(30)),
            ServerConfig::plain("127.0.0.1", 0),
        )
        .with_shutdown_timeout(grace);
        let handle = lifecycle.handle();
        let token = CancellationToken::new();
        let server = tokio::spawn(lifecycle.serve(token.clone()));

        let addr = handle.app_addr().await.expect("listener should start");
        let request = tokio::spawn(async move {
            client().get(format!("http://{}/slow", addr)).send().await
        });

        entered.notified().await;
        let started = std::time::Instant::now();
        let err = stop(token, server).await.unwrap_err();

        assert!(matches!(err, ServerError::ShutdownTimeout(d) if d == grace));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!is_listening(addr));
        request.abort();
    }

    #[tokio::test]
    async fn test_handler_exceeding_write_timeout_gets_408() {
        let entered = Arc::new(Notify::new());
        let mut config = ServerConfig::plain("127.0.0.1", 0);
        config.write_timeout_seconds = 1;
        let lifecycle =
            ServerLifecycle::new(slow_app(entered, Duration::from_secs(3)), config);
        let handle = lifecycle.handle();
        let token = CancellationToken::new();
        let server = tokio::spawn(lifecycle.serve(token.clone()));

        let addr = handle.app_addr().await.expect("listener should start");
        let started = std::time::Instant::now();
        let resp = client()
            .get(format!("http://{}/slow", addr))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), reqwest::StatusCode::REQUEST_TIMEOUT);
        assert!(started.elapsed() < Duration::from_secs(3));
        stop(token, server).await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_server_stops_promptly() {
        let lifecycle = ServerLifecycle::new(app(), ServerConfig::plain("127.0.0.1", 0));
        let handle = lifecycle.handle();
        let token = CancellationToken::new();
        let server = tokio::spawn(lifecycle.serve(token.clone()));

        handle.app_addr().await.expect("listener should start");
        let started = std::time::Instant::now();
        stop(token, server).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}

mod tls {
    use super::*;
    use axum::http::header::{LOCATION, STRICT_TRANSPORT_SECURITY};
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_http_port_redirects_to_https() {
        let lifecycle = ServerLifecycle::new(app(), tls_config(0, Some(443)));
        let handle = lifecycle.handle();
        let token = CancellationToken::new();
        let server = tokio::spawn(lifecycle.serve(token.clone()));

        let redirect_addr = handle.redirect_addr().await.expect("redirect listener should start");
        handle.app_addr().await.expect("TLS listener should start");

        let resp = client()
            .get(format!("http://{}/foo?x=1", redirect_addr))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(resp.headers()[LOCATION], "https://127.0.0.1/foo?x=1");
        assert_eq!(resp.headers()[STRICT_TRANSPORT_SECURITY], "max-age=31536000");

        stop(token, server).await.unwrap();
    }

    #[tokio::test]
    async fn test_redirect_targets_bound_tls_port() {
        let lifecycle = ServerLifecycle::new(app(), tls_config(0, None));
        let handle = lifecycle.handle();
        let token = CancellationToken::new();
        let server = tokio::spawn(lifecycle.serve(token.clone()));

        let redirect_addr = handle.redirect_addr().await.expect("redirect listener should start");
        let tls_addr = handle.app_addr().await.expect("TLS listener should start");

        let resp = client()
            .get(format!("http://{}/a/b?c=d", redirect_addr))
            .send()
            .await
            .unwrap();
        let expected = format!("https://127.0.0.1:{}/a/b?c=d", tls_addr.port());
        assert_eq!(resp.headers()[LOCATION], expected.as_str());

        stop(token, server).await.unwrap();
    }

    #[tokio::test]
    async fn test_https_port_serves_application() {
        let lifecycle = ServerLifecycle::new(app(), tls_config(0, None));
        let handle = lifecycle.handle();
        let token = CancellationToken::new();
        let server = tokio::spawn(lifecycle.serve(token.clone()));

        let tls_addr = handle.app_addr().await.expect("TLS listener should start");
        let redirect_addr = handle.redirect_addr().await.expect("redirect listener should start");

        let body = client()
            .get(format!("https://127.0.0.1:{}/echo?x=1", tls_addr.port()))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "/echo?x=1");

        stop(token, server).await.unwrap();
        assert!(!is_listening(tls_addr));
        assert!(!is_listening(redirect_addr));
    }

    #[tokio::test]
    async fn test_invalid_certificate_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "not a certificate").unwrap();
        std::fs::write(&key, "not a key").unwrap();

        let port = free_port();
        let mut config = tls_config(port, None);
        if let Some(tls) = config.tls.as_mut() {
            tls.cert_path = cert.to_string_lossy().into_owned();
            tls.key_path = key.to_string_lossy().into_owned();
        }

        let err = ServerLifecycle::new(app(), config)
            .serve(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ServerError::Configuration(_)));
        assert!(!is_listening(SocketAddr::from(([127, 0, 0, 1], port))));
    }

    #[tokio::test]
    async fn test_tls_bind_failure_leaves_redirect_port_closed() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let taken_port = taken.local_addr().unwrap().port();
        let redirect_port = free_port();

        let mut config = tls_config(redirect_port, None);
        if let Some(tls) = config.tls.as_mut() {
            tls.port = taken_port;
        }

        let err = ServerLifecycle::new(app(), config)
            .serve(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ServerError::Bind { addr, .. } if addr.port() == taken_port));
        assert!(!is_listening(SocketAddr::from(([127, 0, 0, 1], redirect_port))));
    }

    #[tokio::test]
    async fn test_both_tls_modes_enabled_is_rejected_before_hooks() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        let mut config = tls_config(0, None);
        config.auto_tls = Some(AutoTlsConfig {
            enabled: true,
            accept_tos: true,
            cache_dir: "unused".to_string(),
            hosts: vec!["example.com".to_string()],
            email: None,
            production: false,
            port: 0,
            public_port: None,
        });

        let err = ServerLifecycle::new(app(), config)
            .before_start(move || {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .serve(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ServerError::Configuration(_)));
        assert!(!ran.load(Ordering::SeqCst));
    }
}

mod auto_tls {
    use super::*;
    use axum::http::header::LOCATION;
    use axum::http::StatusCode;

    fn auto_tls_config(cache_dir: &std::path::Path, accept_tos: bool) -> ServerConfig {
        let mut config = ServerConfig::plain("127.0.0.1", 0);
        config.auto_tls = Some(AutoTlsConfig {
            enabled: true,
            accept_tos,
            cache_dir: cache_dir.to_string_lossy().into_owned(),
            hosts: vec!["gaia.example.com".to_string()],
            email: None,
            production: false,
            port: 0,
            public_port: Some(443),
        });
        config
    }

    #[tokio::test]
    async fn test_terms_of_service_must_be_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let err = ServerLifecycle::new(app(), auto_tls_config(dir.path(), false))
            .serve(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Configuration(msg) if msg.contains("accept_tos")));
    }

    #[tokio::test]
    async fn test_redirect_listener_and_clean_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("acme");
        let lifecycle = ServerLifecycle::new(app(), auto_tls_config(&cache_dir, true));
        let handle = lifecycle.handle();
        let token = CancellationToken::new();
        let server = tokio::spawn(lifecycle.serve(token.clone()));

        let redirect_addr = handle.redirect_addr().await.expect("redirect listener should start");
        let tls_addr = handle.app_addr().await.expect("TLS listener should start");
        assert!(cache_dir.is_dir(), "cache directory should be created");

        let resp = client()
            .get(format!("http://{}/login?next=/", redirect_addr))
            .header("Host", "gaia.example.com")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(resp.headers()[LOCATION], "https://gaia.example.com/login?next=/");

        stop(token, server).await.unwrap();
        assert!(!is_listening(redirect_addr));
        assert!(!is_listening(tls_addr));
    }

    #[tokio::test]
    async fn test_acme_challenge_path_is_answered_not_redirected() {
        let dir = tempfile::tempdir().unwrap();
        let lifecycle = ServerLifecycle::new(app(), auto_tls_config(dir.path(), true));
        let handle = lifecycle.handle();
        let token = CancellationToken::new();
        let server = tokio::spawn(lifecycle.serve(token.clone()));

        let redirect_addr = handle.redirect_addr().await.expect("redirect listener should start");

        let resp = client()
            .get(format!("http://{}/.well-known/acme-challenge/tok123", redirect_addr))
            .header("Host", "gaia.example.com")
            .send()
            .await
            .unwrap();
        assert_ne!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert!(resp.headers().get(LOCATION).is_none());

        // Neighbouring paths still redirect
        let resp = client()
            .get(format!("http://{}/.well-known/other", redirect_addr))
            .header("Host", "gaia.example.com")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);

        stop(token, server).await.unwrap();
    }
}
