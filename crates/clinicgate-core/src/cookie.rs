//! Cookie-equivalent persisted state
//!
//! Credentials and the resolved tenant are persisted as site-wide cookies.
//! The same values are read and written from two execution contexts:
//! - client side, through a long-lived jar (`MemoryCookieStore`)
//! - server side, through a per-request view over the `Cookie` header that
//!   queues `Set-Cookie` values for the response (`RequestCookieStore`)

use dashmap::DashMap;
use http::{HeaderMap, HeaderValue, header};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::warn;

/// Short-horizon access credential
pub const ACCESS_TOKEN_COOKIE: &str = "accessToken";
/// Long-horizon refresh credential
pub const REFRESH_TOKEN_COOKIE: &str = "refreshToken";
/// Resolved tenant slug
pub const TENANT_SLUG_COOKIE: &str = "tenantSlug";

/// `SameSite` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    /// First-party context only
    Strict,
    /// Sent on top-level cross-site navigations
    Lax,
}

impl fmt::Display for SameSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SameSite::Strict => f.write_str("Strict"),
            SameSite::Lax => f.write_str("Lax"),
        }
    }
}

/// A cookie to persist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// `None` means a session cookie
    pub max_age: Option<Duration>,
    pub same_site: SameSite,
    pub secure: bool,
    pub path: String,
}

impl Cookie {
    /// Create a site-wide `SameSite=Lax` session cookie
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            max_age: None,
            same_site: SameSite::Lax,
            secure: false,
            path: "/".to_string(),
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = same_site;
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// A cookie that expires `name` immediately
    pub fn removal(name: impl Into<String>) -> Self {
        Self::new(name, "").with_max_age(Duration::ZERO)
    }

    pub fn is_removal(&self) -> bool {
        self.max_age == Some(Duration::ZERO)
    }

    /// Render as a `Set-Cookie` header value
    pub fn to_header_value(&self) -> String {
        let mut rendered = format!("{}={}; Path={}", self.name, self.value, self.path);
        if let Some(max_age) = self.max_age {
            rendered.push_str(&format!("; Max-Age={}", max_age.as_secs()));
        }
        rendered.push_str(&format!("; SameSite={}", self.same_site));
        if self.secure {
            rendered.push_str("; Secure");
        }
        rendered
    }
}

/// Key/value persistence for cookies, path-scoped to the whole site.
///
/// A read always returns the latest written value.
pub trait CookieStore: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;

    fn set(&self, cookie: Cookie);

    fn remove(&self, name: &str) {
        self.set(Cookie::removal(name));
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Client-side cookie jar that honours `Max-Age`
#[derive(Debug, Default)]
pub struct MemoryCookieStore {
    values: DashMap<String, StoredValue>,
}

impl MemoryCookieStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CookieStore for MemoryCookieStore {
    fn get(&self, name: &str) -> Option<String> {
        let now = Instant::now();
        let entry = self.values.get(name)?;
        if entry.is_live(now) {
            Some(entry.value.clone())
        } else {
            drop(entry);
            self.values.remove(name);
            None
        }
    }

    fn set(&self, cookie: Cookie) {
        if cookie.is_removal() {
            self.values.remove(&cookie.name);
            return;
        }
        let expires_at = cookie.max_age.map(|age| Instant::now() + age);
        self.values.insert(
            cookie.name,
            StoredValue {
                value: cookie.value,
                expires_at,
            },
        );
    }
}

/// Server-side view of the cookies for one request.
///
/// Reads come from the request's `Cookie` header, overlaid with writes made
/// while handling the request. Writes are queued per name (last write wins)
/// and emitted as `Set-Cookie` headers with [`RequestCookieStore::apply_to`].
#[derive(Debug, Default)]
pub struct RequestCookieStore {
    incoming: DashMap<String, String>,
    pending: DashMap<String, Cookie>,
}

impl RequestCookieStore {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let incoming = DashMap::new();
        for value in headers.get_all(header::COOKIE) {
            let Ok(raw) = value.to_str() else {
                continue;
            };
            for (name, value) in parse_cookie_header(raw) {
                incoming.insert(name, value);
            }
        }
        Self {
            incoming,
            pending: DashMap::new(),
        }
    }

    /// Queued writes, in no particular order
    pub fn pending(&self) -> Vec<Cookie> {
        self.pending
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Append queued writes to a response's headers as `Set-Cookie`
    pub fn apply_to(&self, headers: &mut HeaderMap) {
        for cookie in self.pending() {
            match HeaderValue::from_str(&cookie.to_header_value()) {
                Ok(value) => {
                    headers.append(header::SET_COOKIE, value);
                }
                Err(e) => warn!("Dropping unrepresentable cookie '{}': {}", cookie.name, e),
            }
        }
    }
}

impl CookieStore for RequestCookieStore {
    fn get(&self, name: &str) -> Option<String> {
        if let Some(written) = self.pending.get(name) {
            return (!written.is_removal()).then(|| written.value.clone());
        }
        self.incoming.get(name).map(|entry| entry.value().clone())
    }

    fn set(&self, cookie: Cookie) {
        self.pending.insert(cookie.name.clone(), cookie);
    }
}

/// Parse a `Cookie` request header into name/value pairs
pub fn parse_cookie_header(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            let value = value.trim().trim_matches('"');
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}
