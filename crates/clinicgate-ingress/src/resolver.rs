//! Tenant resolution
//!
//! Decides which tenant a request belongs to. Sources, highest first:
//! 1. Override query parameter (stripped from the URL by a redirect)
//! 2. Custom domain found in the tenant directory
//! 3. Subdomain of the platform base domain
//! 4. Tenant cookie from an earlier request
//! 5. Platform default
//!
//! Locale normalization is folded into the same pass so a request never
//! gets two redirects in a row.

use axum::http::{HeaderMap, Uri, header};
use clinicgate_core::cookie::{
    Cookie, CookieStore, RequestCookieStore, SameSite, TENANT_SLUG_COOKIE,
};
use clinicgate_core::tenant::{
    ResolutionSource, TenantContext, TenantDirectory, TenantSlug, normalize_host,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{IngressError, IngressResult};
use crate::locale::LocaleConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantConfig {
    /// Platform domain; `<slug>.<base_domain>` selects a tenant
    pub base_domain: String,
    /// Tenant used when nothing else decides
    pub default_slug: String,
    /// Query parameter that forces a tenant
    pub override_param: String,
    /// Subdomains that never name a tenant
    pub reserved_subdomains: Vec<String>,
    /// Path served when the resolved tenant is inactive
    pub not_found_path: String,
    pub cookie_max_age_secs: u64,
    pub cookie_secure: bool,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            base_domain: "localhost".to_string(),
            default_slug: "default".to_string(),
            override_param: "tenant".to_string(),
            reserved_subdomains: vec!["www".to_string()],
            not_found_path: "/not-found".to_string(),
            cookie_max_age_secs: 365 * 24 * 60 * 60,
            cookie_secure: false,
        }
    }
}

/// Outcome of resolving one request
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub context: TenantContext,
    /// Path and query to redirect to before serving anything
    pub redirect_to: Option<String>,
    /// The tenant exists but is inactive; serve the not-found page
    pub not_found: bool,
}

impl Resolution {
    pub fn slug(&self) -> &TenantSlug {
        self.context.slug()
    }
}

pub struct TenantResolver {
    config: TenantConfig,
    locale: LocaleConfig,
    directory: Arc<dyn TenantDirectory>,
    default_slug: TenantSlug,
}

impl TenantResolver {
    pub fn new(
        config: TenantConfig,
        locale: LocaleConfig,
        directory: Arc<dyn TenantDirectory>,
    ) -> IngressResult<Self> {
        let default_slug = TenantSlug::parse(&config.default_slug)
            .map_err(|e| IngressError::InvalidConfig(format!("default tenant: {}", e)))?;
        Ok(Self {
            config,
            locale,
            directory,
            default_slug,
        })
    }

    pub fn config(&self) -> &TenantConfig {
        &self.config
    }

    pub fn locale(&self) -> &LocaleConfig {
        &self.locale
    }

    /// Resolve the tenant for a request
    pub async fn resolve(&self, uri: &Uri, headers: &HeaderMap) -> IngressResult<Resolution> {
        let host = request_host(uri, headers);
        let path = uri.path();

        let query = uri.query().unwrap_or_default();
        let override_value = query_segments(query)
            .find_map(|(_, pair)| pair.filter(|(k, _)| *k == self.config.override_param))
            .map(|(_, v)| v);
        let override_present = override_value.is_some();
        let override_slug = override_value
            .and_then(|v| match TenantSlug::parse(&v) {
                Ok(slug) => Some(slug),
                Err(e) => {
                    debug!("Ignoring tenant override: {}", e);
                    None
                }
            });

        let (slug, source) = if let Some(slug) = override_slug {
            (slug, ResolutionSource::Query)
        } else if let Some(record) = self.lookup_custom_domain(&host).await? {
            if !record.is_active() {
                debug!(host = %host, tenant = %record.slug, "Custom domain maps to an inactive tenant");
                return Ok(Resolution {
                    context: TenantContext::new(record.slug, ResolutionSource::CustomDomain, false),
                    redirect_to: None,
                    not_found: true,
                });
            }
            (record.slug, ResolutionSource::CustomDomain)
        } else if let Some(slug) = self.subdomain_slug(&host) {
            (slug, ResolutionSource::Subdomain)
        } else if let Some(slug) = cookie_slug(headers) {
            (slug, ResolutionSource::Cookie)
        } else {
            (self.default_slug.clone(), ResolutionSource::Default)
        };

        let locale_path = self.locale.normalize_path(path);
        let redirect_to = if override_present || locale_path.is_some() {
            let query = if override_present {
                strip_query_param(query, &self.config.override_param)
            } else {
                query.to_string()
            };
            let target_path = locale_path.unwrap_or_else(|| path.to_string());
            Some(if query.is_empty() {
                target_path
            } else {
                format!("{}?{}", target_path, query)
            })
        } else {
            None
        };

        debug!(
            host = %host,
            tenant = %slug,
            source = %source,
            redirect = redirect_to.is_some(),
            "Resolved tenant"
        );

        Ok(Resolution {
            context: TenantContext::new(slug, source, true),
            redirect_to,
            not_found: false,
        })
    }

    /// Cookie recording the resolved tenant
    pub fn tenant_cookie(&self, slug: &TenantSlug) -> Cookie {
        Cookie::new(TENANT_SLUG_COOKIE, slug.as_str())
            .with_same_site(SameSite::Lax)
            .with_secure(self.config.cookie_secure)
            .with_max_age(Duration::from_secs(self.config.cookie_max_age_secs))
    }

    fn is_platform_host(&self, host: &str) -> bool {
        let base = self.config.base_domain.as_str();
        host.is_empty()
            || host == "localhost"
            || host.ends_with(".localhost")
            || host == base
            || host
                .strip_suffix(base)
                .is_some_and(|label| label.ends_with('.'))
    }

    async fn lookup_custom_domain(
        &self,
        host: &str,
    ) -> IngressResult<Option<clinicgate_core::tenant::TenantRecord>> {
        if self.is_platform_host(host) {
            return Ok(None);
        }
        Ok(self.directory.find_by_domain(host).await?)
    }

    fn subdomain_slug(&self, host: &str) -> Option<TenantSlug> {
        let label = host
            .strip_suffix(self.config.base_domain.as_str())?
            .strip_suffix('.')?;
        if label.is_empty() || label.contains('.') {
            return None;
        }
        if self
            .config
            .reserved_subdomains
            .iter()
            .any(|reserved| reserved.eq_ignore_ascii_case(label))
        {
            return None;
        }
        TenantSlug::parse(label).ok()
    }
}

fn request_host(uri: &Uri, headers: &HeaderMap) -> String {
    let raw = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.authority().map(|a| a.as_str()))
        .unwrap_or_default();
    normalize_host(raw)
}

/// Raw `&`-separated query segments, each with its decoded `(key, value)`
fn query_segments(query: &str) -> impl Iterator<Item = (&str, Option<(String, String)>)> {
    query
        .split('&')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let pair = serde_urlencoded::from_str::<Vec<(String, String)>>(segment)
                .ok()
                .and_then(|pairs| pairs.into_iter().next());
            (segment, pair)
        })
}

/// Drop every `name` parameter, leaving the other segments byte-for-byte
fn strip_query_param(query: &str, name: &str) -> String {
    query_segments(query)
        .filter(|(_, pair)| !pair.as_ref().is_some_and(|(k, _)| k == name))
        .map(|(raw, _)| raw)
        .collect::<Vec<_>>()
        .join("&")
}

fn cookie_slug(headers: &HeaderMap) -> Option<TenantSlug> {
    RequestCookieStore::from_headers(headers)
        .get(TENANT_SLUG_COOKIE)
        .and_then(|raw| TenantSlug::parse(&raw).ok())
}
