use anyhow::Context;
use clinicgate_core::tenant::TenantRecord;
use clinicgate_egress::HttpClientConfig;
use clinicgate_ingress::{LocaleConfig, TenantConfig};
use clinicgate_session::{LifecycleConfig, SessionStoreConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub tenant: TenantConfig,

    #[serde(default)]
    pub locale: LocaleConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub cookies: CookieConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Seed list for the custom-domain directory
    #[serde(default)]
    pub tenants: Vec<TenantRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Backend base URL; may carry a path prefix
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    #[serde(default = "default_tenant_header")]
    pub tenant_header: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_lead_time_secs")]
    pub refresh_lead_time_secs: u64,

    #[serde(default = "default_min_delay_secs")]
    pub refresh_min_delay_secs: u64,

    #[serde(default = "default_cooldown_secs")]
    pub refresh_cooldown_secs: u64,

    #[serde(default = "default_expiry_buffer_secs")]
    pub expiry_buffer_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieConfig {
    #[serde(default)]
    pub secure: bool,

    #[serde(default = "default_access_lifetime_secs")]
    pub access_lifetime_secs: u64,

    #[serde(default = "default_refresh_lifetime_secs")]
    pub refresh_lifetime_secs: u64,

    #[serde(default = "default_min_lifetime_secs")]
    pub min_lifetime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tenant: TenantConfig::default(),
            locale: LocaleConfig::default(),
            auth: AuthConfig::default(),
            cookies: CookieConfig::default(),
            logging: LoggingConfig::default(),
            tenants: Vec::new(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            tenant_header: default_tenant_header(),
            timeout_secs: default_timeout_secs(),
            refresh_lead_time_secs: default_lead_time_secs(),
            refresh_min_delay_secs: default_min_delay_secs(),
            refresh_cooldown_secs: default_cooldown_secs(),
            expiry_buffer_secs: default_expiry_buffer_secs(),
        }
    }
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            secure: false,
            access_lifetime_secs: default_access_lifetime_secs(),
            refresh_lifetime_secs: default_refresh_lifetime_secs(),
            min_lifetime_secs: default_min_lifetime_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AuthConfig {
    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            lead_time: Duration::from_secs(self.refresh_lead_time_secs),
            min_delay: Duration::from_secs(self.refresh_min_delay_secs),
            cooldown: Duration::from_secs(self.refresh_cooldown_secs),
            expiry_buffer: Duration::from_secs(self.expiry_buffer_secs),
            ..Default::default()
        }
    }

    pub fn client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout_secs: self.timeout_secs,
            ..Default::default()
        }
    }
}

impl CookieConfig {
    pub fn store_config(&self) -> SessionStoreConfig {
        SessionStoreConfig {
            access_lifetime: Duration::from_secs(self.access_lifetime_secs),
            refresh_lifetime: Duration::from_secs(self.refresh_lifetime_secs),
            min_lifetime: Duration::from_secs(self.min_lifetime_secs),
            secure: self.secure,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config = if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml::from_str(&contents)
                .with_context(|| format!("Invalid TOML in {}", path.display()))?
        } else {
            // Default to YAML
            serde_yaml::from_str(&contents)
                .with_context(|| format!("Invalid YAML in {}", path.display()))?
        };

        Ok(config)
    }

    /// Merge environment variables into config (env vars take precedence)
    pub fn merge_env(&mut self) {
        // Tracing is not initialized yet, so warnings go to stderr
        if let Ok(val) = std::env::var("CLINICGATE_HOST") {
            self.host = val;
        }

        if let Ok(val) = std::env::var("CLINICGATE_PORT") {
            match val.parse::<u16>() {
                Ok(port) => self.port = port,
                Err(_) => eprintln!("Warning: Invalid CLINICGATE_PORT '{}', ignoring", val),
            }
        }

        if let Ok(val) = std::env::var("CLINICGATE_LOG_LEVEL") {
            self.logging.level = val;
        }

        if let Ok(val) = std::env::var("CLINICGATE_LOG_JSON")
            && let Ok(json) = val.parse::<bool>()
        {
            self.logging.json = json;
        }

        if let Ok(val) = std::env::var("CLINICGATE_BASE_DOMAIN") {
            self.tenant.base_domain = val;
        }

        if let Ok(val) = std::env::var("CLINICGATE_DEFAULT_TENANT") {
            self.tenant.default_slug = val;
        }

        if let Ok(val) = std::env::var("CLINICGATE_AUTH_API_URL") {
            self.auth.api_base_url = val;
        }

        if let Ok(val) = std::env::var("CLINICGATE_SECURE_COOKIES")
            && let Ok(secure) = val.parse::<bool>()
        {
            self.cookies.secure = secure;
        }
    }

    /// Tenant settings with the shared cookie policy applied
    pub fn effective_tenant_config(&self) -> TenantConfig {
        TenantConfig {
            cookie_secure: self.cookies.secure,
            ..self.tenant.clone()
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_api_base_url() -> String {
    "http://127.0.0.1:4000/api".to_string()
}

fn default_tenant_header() -> String {
    clinicgate_egress::request::DEFAULT_TENANT_HEADER.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_lead_time_secs() -> u64 {
    15
}

fn default_min_delay_secs() -> u64 {
    5
}

fn default_cooldown_secs() -> u64 {
    5
}

fn default_expiry_buffer_secs() -> u64 {
    10
}

fn default_access_lifetime_secs() -> u64 {
    60 * 60
}

fn default_refresh_lifetime_secs() -> u64 {
    30 * 24 * 60 * 60
}

fn default_min_lifetime_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}
