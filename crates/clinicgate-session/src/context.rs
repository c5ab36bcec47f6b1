//! Session context
//!
//! Bundles the cookie jar, session store and lifecycle manager of one
//! session so they can be built once and handed to whatever needs them.
//! A long-lived client builds one at bootstrap; the server builds one per
//! request over that request's cookie jar.

use clinicgate_core::cookie::{CookieStore, TENANT_SLUG_COOKIE};
use clinicgate_core::tenant::TenantSlug;
use std::sync::Arc;
use tracing::debug;

use crate::api::AuthApi;
use crate::lifecycle::{LifecycleConfig, TokenLifecycleManager};
use crate::store::{Session, SessionStore, SessionStoreConfig};

#[derive(Clone)]
pub struct SessionContext {
    cookies: Arc<dyn CookieStore>,
    store: Arc<SessionStore>,
    lifecycle: TokenLifecycleManager,
}

impl SessionContext {
    /// Wire the components without starting the refresh timer
    pub fn new(
        api: Arc<dyn AuthApi>,
        cookies: Arc<dyn CookieStore>,
        store_config: SessionStoreConfig,
        lifecycle_config: LifecycleConfig,
    ) -> Self {
        let store = Arc::new(SessionStore::new(cookies.clone(), store_config));
        let lifecycle = TokenLifecycleManager::new(api, store.clone(), lifecycle_config);
        Self {
            cookies,
            store,
            lifecycle,
        }
    }

    /// Wire the components and start managing the persisted session
    pub fn bootstrap(
        api: Arc<dyn AuthApi>,
        cookies: Arc<dyn CookieStore>,
        store_config: SessionStoreConfig,
        lifecycle_config: LifecycleConfig,
    ) -> Self {
        let context = Self::new(api, cookies, store_config, lifecycle_config);
        context.lifecycle.start();
        debug!(
            authenticated = context.lifecycle.is_authenticated(),
            "Session context started"
        );
        context
    }

    pub fn shutdown(&self) {
        self.lifecycle.stop();
    }

    pub fn cookies(&self) -> &Arc<dyn CookieStore> {
        &self.cookies
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn lifecycle(&self) -> &TokenLifecycleManager {
        &self.lifecycle
    }

    pub fn session(&self) -> Option<Session> {
        self.store.get()
    }

    /// Tenant recorded by the last resolution; unreadable values count as absent
    pub fn tenant_slug(&self) -> Option<TenantSlug> {
        self.cookies
            .get(TENANT_SLUG_COOKIE)
            .and_then(|raw| TenantSlug::parse(&raw).ok())
    }
}
