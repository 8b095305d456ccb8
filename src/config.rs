//! Configuration loading and constants.
//!
//! Loads application configuration from TOML files. `AppConfig` is the root
//! configuration struct; `ServerConfig` carries everything the server lifecycle
//! needs, including the TLS and AutoTLS sections.

use const_format::formatcp;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// HTTP Security Headers
// =============================================================================

/// HSTS max-age sent with HTTP->HTTPS redirects (one year)
pub const HSTS_MAX_AGE: u32 = 31_536_000;

pub const STRICT_TRANSPORT_SECURITY: &str = formatcp!("max-age={}", HSTS_MAX_AGE);

/// Default port for the TLS listener
pub const DEFAULT_HTTPS_PORT: u16 = 443;

// =============================================================================
// Server Defaults
// =============================================================================

/// Default bound on graceful shutdown
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Default read/write/idle timeout
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 5;

/// Delay between health probe attempts
pub const HEALTH_PROBE_INTERVAL_SECS: u64 = 1;

/// Path of the liveness endpoint
pub const HEALTH_PATH: &str = "/sd/health";

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Default ACME certificate cache directory
pub const DEFAULT_ACME_CACHE_DIR: &str = "acme-cache";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// HTTP server configuration
    pub http: ServerConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Run mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Dev,
    Prod,
    Test,
}

impl Mode {
    /// Log filter used when neither the CLI, `RUST_LOG` nor the config sets one.
    pub fn default_log_filter(self) -> &'static str {
        match self {
            Mode::Dev => "gaia=debug,tower_http=debug",
            Mode::Prod => "gaia=info,tower_http=info",
            Mode::Test => "gaia=warn,tower_http=warn",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Dev => "dev",
            Mode::Prod => "prod",
            Mode::Test => "test",
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub mode: Mode,
    pub host: String,
    pub port: u16,
    #[serde(default = "ServerConfig::default_connection_timeout")]
    pub read_timeout_seconds: u64,
    #[serde(default = "ServerConfig::default_connection_timeout")]
    pub write_timeout_seconds: u64,
    #[serde(default = "ServerConfig::default_connection_timeout")]
    pub idle_timeout_seconds: u64,
    /// Bound on graceful shutdown before connections are force-closed
    #[serde(default = "ServerConfig::default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
    /// Health probe attempts after startup (0 disables the probe)
    #[serde(default)]
    pub max_ping_count: u32,
    pub tls: Option<TlsConfig>,
    pub auto_tls: Option<AutoTlsConfig>,
}

/// Static certificate TLS settings
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Port of the TLS listener
    #[serde(default = "default_https_port")]
    pub port: u16,
    #[serde(default)]
    pub cert_path: String,
    #[serde(default)]
    pub key_path: String,
    /// HTTPS port advertised in redirects, if it differs from `port`
    pub public_port: Option<u16>,
}

/// ACME (Let's Encrypt) settings
#[derive(Debug, Clone, Deserialize)]
pub struct AutoTlsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Must be true for certificates to be requested
    #[serde(default)]
    pub accept_tos: bool,
    #[serde(default = "AutoTlsConfig::default_cache_dir")]
    pub cache_dir: String,
    /// Hostnames certificates may be issued for
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Contact address registered with the ACME account
    pub email: Option<String>,
    /// Use the Let's Encrypt production directory instead of staging
    #[serde(default)]
    pub production: bool,
    #[serde(default = "default_https_port")]
    pub port: u16,
    pub public_port: Option<u16>,
}

impl AutoTlsConfig {
    fn default_cache_dir() -> String {
        DEFAULT_ACME_CACHE_DIR.to_string()
    }
}

fn default_https_port() -> u16 {
    DEFAULT_HTTPS_PORT
}

/// How the server exposes the application, resolved from `ServerConfig`.
#[derive(Debug, Clone, Copy)]
pub enum ListenerMode<'a> {
    Plain,
    Tls(&'a TlsConfig),
    AutoTls(&'a AutoTlsConfig),
}

impl ServerConfig {
    fn default_connection_timeout() -> u64 {
        DEFAULT_CONNECTION_TIMEOUT_SECS
    }

    fn default_shutdown_timeout() -> u64 {
        DEFAULT_SHUTDOWN_TIMEOUT_SECS
    }

    /// Plain HTTP configuration listening on `host:port`, with default timeouts.
    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        Self {
            mode: Mode::default(),
            host: host.into(),
            port,
            read_timeout_seconds: DEFAULT_CONNECTION_TIMEOUT_SECS,
            write_timeout_seconds: DEFAULT_CONNECTION_TIMEOUT_SECS,
            idle_timeout_seconds: DEFAULT_CONNECTION_TIMEOUT_SECS,
            shutdown_timeout_seconds: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            max_ping_count: 0,
            tls: None,
            auto_tls: None,
        }
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls.as_ref().is_some_and(|t| t.enabled)
    }

    pub fn auto_tls_enabled(&self) -> bool {
        self.auto_tls.as_ref().is_some_and(|t| t.enabled)
    }

    /// Resolve the listener mode. TLS and AutoTLS are mutually exclusive.
    pub fn listener_mode(&self) -> Result<ListenerMode<'_>, ConfigError> {
        match (&self.tls, &self.auto_tls) {
            (Some(tls), Some(auto)) if tls.enabled && auto.enabled => Err(ConfigError::Validation(
                "http.tls and http.auto_tls cannot both be enabled".to_string(),
            )),
            (Some(tls), _) if tls.enabled => {
                if tls.cert_path.is_empty() || tls.key_path.is_empty() {
                    return Err(ConfigError::Validation(
                        "http.tls requires cert_path and key_path".to_string(),
                    ));
                }
                Ok(ListenerMode::Tls(tls))
            }
            (_, Some(auto)) if auto.enabled => {
                if auto.hosts.is_empty() {
                    return Err(ConfigError::Validation(
                        "http.auto_tls requires at least one host".to_string(),
                    ));
                }
                if !auto.accept_tos {
                    return Err(ConfigError::Validation(
                        "http.auto_tls requires accept_tos = true".to_string(),
                    ));
                }
                Ok(ListenerMode::AutoTls(auto))
            }
            _ => Ok(ListenerMode::Plain),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_seconds)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log filter directive, e.g. "gaia=debug" (defaults by run mode)
    pub level: Option<String>,
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }

    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(contents)?;

        config.http.listener_mode()?;

        if config.http.host.is_empty() {
            return Err(ConfigError::Validation("http.host must not be empty".to_string()));
        }

        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}
