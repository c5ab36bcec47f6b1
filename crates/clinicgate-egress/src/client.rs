//! Shared HTTP client utilities

use crate::{RequestError, Result};
use reqwest::{Client, ClientBuilder, Url};
use std::time::Duration;

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,

    /// Maximum number of idle connections per host
    pub pool_max_idle_per_host: usize,

    /// User agent string
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            connect_timeout_secs: 10,
            pool_max_idle_per_host: 32,
            user_agent: format!("ClinicGate/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Create a configured HTTP client with connection pooling
pub fn create_client(config: &HttpClientConfig) -> Result<Client> {
    ClientBuilder::new()
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        // Expire idle connections before the backend closes them
        .pool_idle_timeout(Duration::from_secs(90))
        .user_agent(&config.user_agent)
        .use_rustls_tls()
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .map_err(|e| RequestError::Config(format!("Failed to create HTTP client: {}", e)))
}

/// Join `path` onto `base_url`.
///
/// The base may already carry a path prefix (`https://host/api/v1`); a path
/// that repeats that prefix is not prefixed twice. Absolute URLs pass through
/// only when they share the base's origin; anything else is a config error,
/// so credentials attached to the request never leave the backend.
pub fn join_url(base_url: &str, path: &str) -> Result<String> {
    if path.starts_with("http://") || path.starts_with("https://") {
        let target = Url::parse(path)
            .map_err(|e| RequestError::Config(format!("Invalid URL {}: {}", path, e)))?;
        let base = Url::parse(base_url)
            .map_err(|e| RequestError::Config(format!("Invalid base URL {}: {}", base_url, e)))?;
        if target.origin() != base.origin() {
            return Err(RequestError::Config(format!(
                "Refusing request to {}: outside {}",
                target.origin().ascii_serialization(),
                base.origin().ascii_serialization()
            )));
        }
        return Ok(path.to_string());
    }

    let base = base_url.trim_end_matches('/');
    let prefix = base
        .split_once("://")
        .and_then(|(_, rest)| rest.find('/').map(|idx| &rest[idx + 1..]))
        .unwrap_or("");

    let mut path = path.trim_start_matches('/');
    if !prefix.is_empty()
        && let Some(rest) = path.strip_prefix(prefix)
        && (rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'))
    {
        path = rest.trim_start_matches('/');
    }

    Ok(if path.is_empty() {
        base.to_string()
    } else if path.starts_with('?') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    })
}
