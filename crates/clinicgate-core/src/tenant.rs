//! Tenant types and context for multi-tenancy support

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Maximum slug length (one DNS label)
const MAX_SLUG_LEN: usize = 63;

/// URL-safe identifier of a tenant (one clinic).
///
/// Slugs double as subdomain labels, so they follow DNS label rules:
/// lowercase ASCII letters, digits and `-`, 1 to 63 characters, and
/// no leading or trailing `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantSlug(String);

impl TenantSlug {
    /// Parse a slug, trimming and lowercasing the input first
    pub fn parse(raw: &str) -> Result<Self> {
        let candidate = raw.trim().to_ascii_lowercase();

        if candidate.is_empty() {
            return Err(Error::InvalidTenant("Tenant slug is empty".to_string()));
        }
        if candidate.len() > MAX_SLUG_LEN {
            return Err(Error::InvalidTenant(format!(
                "Tenant slug exceeds {} characters",
                MAX_SLUG_LEN
            )));
        }
        if candidate.starts_with('-') || candidate.ends_with('-') {
            return Err(Error::InvalidTenant(format!(
                "Tenant slug '{}' cannot start or end with '-'",
                candidate
            )));
        }
        if !candidate
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(Error::InvalidTenant(format!(
                "Tenant slug '{}' contains invalid characters",
                candidate
            )));
        }

        Ok(Self(candidate))
    }

    /// Get the slug as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantSlug {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TenantSlug {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<TenantSlug> for String {
    fn from(slug: TenantSlug) -> Self {
        slug.0
    }
}

/// Which input decided the tenant for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    /// Explicit override query parameter
    Query,
    /// Exact match in the custom-domain directory
    CustomDomain,
    /// Label in front of the platform base domain
    Subdomain,
    /// Tenant cookie left by an earlier request
    Cookie,
    /// Platform default tenant
    Default,
}

impl ResolutionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionSource::Query => "query",
            ResolutionSource::CustomDomain => "custom_domain",
            ResolutionSource::Subdomain => "subdomain",
            ResolutionSource::Cookie => "cookie",
            ResolutionSource::Default => "default",
        }
    }
}

impl fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request tenant context.
///
/// Created by the tenant resolver for every inbound request and dropped
/// with the response. Fields are private so the slug cannot change once
/// a request has been resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantContext {
    slug: TenantSlug,
    resolved_from: ResolutionSource,
    active: bool,
}

impl TenantContext {
    pub fn new(slug: TenantSlug, resolved_from: ResolutionSource, active: bool) -> Self {
        Self {
            slug,
            resolved_from,
            active,
        }
    }

    pub fn slug(&self) -> &TenantSlug {
        &self.slug
    }

    pub fn resolved_from(&self) -> ResolutionSource {
        self.resolved_from
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// Tenant lifecycle status as recorded in the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    #[default]
    Active,
    Inactive,
}

/// Directory entry for a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub slug: TenantSlug,

    #[serde(default)]
    pub status: TenantStatus,

    /// Exact host name served for this tenant, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_domain: Option<String>,
}

impl TenantRecord {
    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }
}

/// Lookup of tenants by custom domain
///
/// Implementations:
/// - `InMemoryTenantDirectory`: seeded from configuration
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// Find the tenant serving `domain`.
    ///
    /// `domain` is already normalized with [`normalize_host`]. Returns the
    /// record regardless of its status; callers decide what an inactive
    /// tenant means.
    async fn find_by_domain(&self, domain: &str) -> Result<Option<TenantRecord>>;
}

/// Concurrent in-memory tenant directory keyed by exact domain
#[derive(Debug, Default)]
pub struct InMemoryTenantDirectory {
    by_domain: DashMap<String, TenantRecord>,
}

impl InMemoryTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a directory from records; records without a custom domain are skipped
    pub fn from_records(records: impl IntoIterator<Item = TenantRecord>) -> Self {
        let directory = Self::new();
        for record in records {
            directory.insert(record);
        }
        directory
    }

    /// Insert or replace a record. Returns false if it has no custom domain.
    pub fn insert(&self, record: TenantRecord) -> bool {
        let Some(domain) = record.custom_domain.as_deref().map(normalize_host) else {
            return false;
        };
        self.by_domain.insert(domain, record);
        true
    }

    pub fn remove_domain(&self, domain: &str) -> Option<TenantRecord> {
        self.by_domain
            .remove(&normalize_host(domain))
            .map(|(_, record)| record)
    }

    pub fn len(&self) -> usize {
        self.by_domain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_domain.is_empty()
    }
}

#[async_trait]
impl TenantDirectory for InMemoryTenantDirectory {
    async fn find_by_domain(&self, domain: &str) -> Result<Option<TenantRecord>> {
        Ok(self.by_domain.get(domain).map(|entry| entry.value().clone()))
    }
}

/// Normalize a `Host` value: lowercase, no port, no trailing dot
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();

    // Bracketed IPv6 literal, keep the brackets and drop the port
    let without_port = if host.starts_with('[') {
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        host.split(':').next().unwrap_or(host)
    };

    without_port.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(slug: &str, domain: Option<&str>, status: TenantStatus) -> TenantRecord {
        TenantRecord {
            slug: TenantSlug::parse(slug).unwrap(),
            status,
            custom_domain: domain.map(str::to_string),
        }
    }

    #[test]
    fn test_slug_parse_normalizes_case_and_whitespace() {
        let slug = TenantSlug::parse("  Clinic-A ").unwrap();
        assert_eq!(slug.as_str(), "clinic-a");
        assert_eq!(slug.to_string(), "clinic-a");
    }

    #[test]
    fn test_slug_parse_rejects_invalid() {
        assert!(TenantSlug::parse("").is_err());
        assert!(TenantSlug::parse("-clinic").is_err());
        assert!(TenantSlug::parse("clinic-").is_err());
        assert!(TenantSlug::parse("clinic_a").is_err());
        assert!(TenantSlug::parse("clinic.a").is_err());
        assert!(TenantSlug::parse(&"a".repeat(64)).is_err());
        assert!(TenantSlug::parse(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn test_slug_serde_validates() {
        let slug: TenantSlug = serde_json::from_str("\"clinic-b\"").unwrap();
        assert_eq!(slug.as_str(), "clinic-b");

        let invalid: std::result::Result<TenantSlug, _> = serde_json::from_str("\"bad slug\"");
        assert!(invalid.is_err());
    }

    #[test]
    fn test_resolution_source_display() {
        assert_eq!(ResolutionSource::CustomDomain.to_string(), "custom_domain");
        assert_eq!(ResolutionSource::Query.as_str(), "query");
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Clinic-A.Example.com:3000"), "clinic-a.example.com");
        assert_eq!(normalize_host("example.com."), "example.com");
        assert_eq!(normalize_host("[::1]:8080"), "[::1]");
        assert_eq!(normalize_host("localhost"), "localhost");
    }

    #[tokio::test]
    async fn test_in_memory_directory_lookup() {
        let directory = InMemoryTenantDirectory::from_records(vec![
            record("smile", Some("SmileDental.com"), TenantStatus::Active),
            record("closed", Some("closed-clinic.org"), TenantStatus::Inactive),
            record("nodomain", None, TenantStatus::Active),
        ]);

        assert_eq!(directory.len(), 2);

        let found = directory.find_by_domain("smiledental.com").await.unwrap();
        assert_eq!(found.unwrap().slug.as_str(), "smile");

        let inactive = directory
            .find_by_domain("closed-clinic.org")
            .await
            .unwrap()
            .unwrap();
        assert!(!inactive.is_active());

        assert!(directory.find_by_domain("unknown.com").await.unwrap().is_none());
    }

    #[test]
    fn test_directory_remove_domain() {
        let directory = InMemoryTenantDirectory::new();
        assert!(directory.insert(record("smile", Some("smile.com"), TenantStatus::Active)));
        assert!(!directory.insert(record("bare", None, TenantStatus::Active)));

        let removed = directory.remove_domain("SMILE.com").unwrap();
        assert_eq!(removed.slug.as_str(), "smile");
        assert!(directory.is_empty());
    }
}
