//! Session persistence
//!
//! `SessionStore` keeps the access and refresh credentials in a
//! [`CookieStore`] as two independently-lived values, derives the access
//! expiry from the credential's claims, and publishes every change to
//! subscribers through a `watch` channel.

use chrono::{DateTime, Utc};
use clinicgate_core::cookie::{
    ACCESS_TOKEN_COOKIE, Cookie, CookieStore, REFRESH_TOKEN_COOKIE, SameSite,
};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::api::{Identity, TokenSet};
use crate::claims::decode_claims;

/// Persistence settings for session cookies
#[derive(Debug, Clone)]
pub struct SessionStoreConfig {
    /// Access cookie lifetime when the server supplies no expiry
    pub access_lifetime: Duration,
    /// Refresh cookie lifetime when the server supplies no expiry
    pub refresh_lifetime: Duration,
    /// Floor applied to every computed lifetime
    pub min_lifetime: Duration,
    /// Mark cookies `Secure`
    pub secure: bool,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            access_lifetime: Duration::from_secs(60 * 60),
            refresh_lifetime: Duration::from_secs(30 * 24 * 60 * 60),
            min_lifetime: Duration::from_secs(60),
            secure: false,
        }
    }
}

/// Snapshot of the signed-in user's credentials
#[derive(Clone, PartialEq)]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Derived from the access credential's `exp` claim
    pub access_expires_at: Option<DateTime<Utc>>,
    pub identity: Option<Identity>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("has_access_token", &self.access_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("access_expires_at", &self.access_expires_at)
            .field("identity", &self.identity)
            .finish()
    }
}

/// Reads and writes the persisted session
pub struct SessionStore {
    cookies: Arc<dyn CookieStore>,
    config: SessionStoreConfig,
    identity: RwLock<Option<Identity>>,
    changes: watch::Sender<Option<Session>>,
}

impl SessionStore {
    pub fn new(cookies: Arc<dyn CookieStore>, config: SessionStoreConfig) -> Self {
        let (changes, _) = watch::channel(None);
        let store = Self {
            cookies,
            config,
            identity: RwLock::new(None),
            changes,
        };
        // Seed subscribers with whatever is already persisted
        store.changes.send_replace(store.get());
        store
    }

    /// Current session, read fresh from persisted state
    pub fn get(&self) -> Option<Session> {
        let access_token = self.cookies.get(ACCESS_TOKEN_COOKIE);
        let refresh_token = self.cookies.get(REFRESH_TOKEN_COOKIE);
        if access_token.is_none() && refresh_token.is_none() {
            return None;
        }

        let claims = access_token
            .as_deref()
            .and_then(|token| decode_claims(token.as_bytes()).ok());
        let access_expires_at = claims.as_ref().and_then(|c| c.expires_at());
        let identity = self
            .read_identity()
            .or_else(|| claims.as_ref().and_then(|c| c.identity()));

        Some(Session {
            access_token,
            refresh_token,
            access_expires_at,
            identity,
        })
    }

    pub fn access_token(&self) -> Option<String> {
        self.cookies.get(ACCESS_TOKEN_COOKIE)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.cookies.get(REFRESH_TOKEN_COOKIE)
    }

    /// Persist a refreshed token pair and return the resulting session.
    ///
    /// A profile attached with [`set_identity`](Self::set_identity) is kept.
    pub fn set(&self, tokens: &TokenSet) -> Session {
        let now = Utc::now();
        let claims = match decode_claims(tokens.access_token.as_bytes()) {
            Ok(claims) => Some(claims),
            Err(e) => {
                warn!("Access token claims unreadable, expiry unknown: {}", e);
                None
            }
        };

        let access_expiry = tokens
            .access_expires_at
            .or_else(|| claims.as_ref().and_then(|c| c.expires_at()));
        let access_age = effective_lifetime(
            access_expiry,
            now,
            self.config.access_lifetime,
            self.config.min_lifetime,
        );
        let refresh_age = effective_lifetime(
            tokens.refresh_expires_at,
            now,
            self.config.refresh_lifetime,
            self.config.min_lifetime,
        );

        self.cookies.set(
            self.credential_cookie(ACCESS_TOKEN_COOKIE, &tokens.access_token)
                .with_max_age(access_age),
        );
        self.cookies.set(
            self.credential_cookie(REFRESH_TOKEN_COOKIE, &tokens.refresh_token)
                .with_max_age(refresh_age),
        );

        debug!(
            access_max_age_secs = access_age.as_secs(),
            refresh_max_age_secs = refresh_age.as_secs(),
            "Persisted session tokens"
        );

        let session = Session {
            access_token: Some(tokens.access_token.clone()),
            refresh_token: Some(tokens.refresh_token.clone()),
            access_expires_at: claims.as_ref().and_then(|c| c.expires_at()),
            identity: self
                .read_identity()
                .or_else(|| claims.as_ref().and_then(|c| c.identity())),
        };
        self.changes.send_replace(Some(session.clone()));
        session
    }

    /// Persist the token pair of a new sign-in, dropping any attached profile
    pub fn replace(&self, tokens: &TokenSet) -> Session {
        *self
            .identity
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.set(tokens)
    }

    /// Attach a loaded profile to the current session
    pub fn set_identity(&self, identity: Identity) {
        *self
            .identity
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(identity);
        self.changes.send_replace(self.get());
    }

    /// Remove every session value at once
    pub fn clear(&self) {
        self.cookies.remove(ACCESS_TOKEN_COOKIE);
        self.cookies.remove(REFRESH_TOKEN_COOKIE);
        *self
            .identity
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.changes.send_replace(None);
        debug!("Cleared session");
    }

    /// Receiver that always holds the latest session snapshot
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.changes.subscribe()
    }

    fn read_identity(&self) -> Option<Identity> {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn credential_cookie(&self, name: &str, value: &str) -> Cookie {
        Cookie::new(name, value)
            .with_same_site(SameSite::Strict)
            .with_secure(self.config.secure)
    }
}

/// Lifetime until `expires_at`, floored to `min`; `default` when unknown
pub fn effective_lifetime(
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    default: Duration,
    min: Duration,
) -> Duration {
    let lifetime = match expires_at {
        Some(at) => at.signed_duration_since(now).to_std().unwrap_or(Duration::ZERO),
        None => default,
    };
    lifetime.max(min)
}
