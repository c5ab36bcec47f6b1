//! ClinicGate Server
//!
//! Front door for the multi-tenant clinic platform:
//! - Resolves the tenant of every request (override, custom domain, subdomain, cookie)
//! - Normalizes page paths to a supported locale
//! - Renders the caller's session for server-side pages, refreshing it when needed
//! - Proxies authorized calls to the clinic backend
//!
//! Usage:
//! ```bash
//! # With config file
//! clinicgate-server --config clinicgate.yaml
//!
//! # Or with environment variables
//! CLINICGATE_AUTH_API_URL=https://api.clinics.example.com clinicgate-server
//!
//! # With both (env vars override config, CLI flags override both)
//! CLINICGATE_BASE_DOMAIN=clinics.example.com clinicgate-server --config clinicgate.yaml --port 8080
//! ```
//!
//! Test with:
//! ```bash
//! curl -i -H "Host: clinic-a.localhost" http://localhost:3000/en/session
//! ```

mod app;
mod config;

use anyhow::Context;
use clap::Parser;
use config::ServerConfig;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// ClinicGate Server - tenant-aware session gateway
#[derive(Parser)]
#[command(name = "clinicgate-server")]
#[command(version, about = "ClinicGate tenant and session gateway", long_about = None)]
struct Cli {
    /// Path to configuration file (YAML or TOML)
    #[arg(short, long, value_name = "FILE", env = "CLINICGATE_CONFIG")]
    config: Option<String>,

    /// Address to bind (overrides config and environment)
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Port to listen on (overrides config and environment)
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level or filter directive, e.g. `debug` or `clinicgate_session=trace`
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };

    // Merge environment variables (they override config file)
    config.merge_env();

    // CLI flags have the highest precedence
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    init_tracing(&config.logging)?;

    match &cli.config {
        Some(path) => info!("Loaded configuration from {}", path),
        None => info!("Using default configuration"),
    }
    info!(
        base_domain = %config.tenant.base_domain,
        default_tenant = %config.tenant.default_slug,
        custom_domains = config.tenants.len(),
        "Tenant resolution configured"
    );
    info!(api = %config.auth.api_base_url, "Auth backend configured");
    if !config.cookies.secure {
        warn!("Cookies are not marked Secure; enable cookies.secure behind HTTPS");
    }

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.host, config.port))?;

    let state = app::AppState::new(config)?;
    let router = app::router(state)?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("ClinicGate listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

fn init_tracing(logging: &config::LoggingConfig) -> anyhow::Result<()> {
    // RUST_LOG wins over the configured level when set
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .with_context(|| format!("Invalid log level '{}'", logging.level))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
