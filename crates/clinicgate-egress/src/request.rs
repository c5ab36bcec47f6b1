//! Authorized requests to the clinic backend
//!
//! Every request carries the current access credential and the tenant slug,
//! both read at send time so a refresh or tenant switch that happened in the
//! meantime is picked up. An HTTP 401 triggers one refresh-and-retry; nothing
//! else is retried.

use clinicgate_session::SessionContext;
use http::{HeaderMap, Method, StatusCode};
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::client::{HttpClientConfig, create_client, join_url};
use crate::envelope::read_response;
use crate::{RequestError, Result};

/// Header carrying the tenant slug on outbound calls
pub const DEFAULT_TENANT_HEADER: &str = "X-Tenant-Slug";

#[derive(Debug, Clone)]
pub struct RequestClientConfig {
    /// Backend base URL, optionally with a path prefix
    pub base_url: String,
    pub tenant_header: String,
}

impl RequestClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            tenant_header: DEFAULT_TENANT_HEADER.to_string(),
        }
    }
}

/// Method, body and extra headers of one call
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub method: Method,
    pub body: Option<serde_json::Value>,
    pub headers: HeaderMap,
}

impl RequestOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Default::default()
        }
    }

    pub fn with_json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self> {
        self.body = Some(
            serde_json::to_value(body)
                .map_err(|e| RequestError::Parse(format!("Failed to encode body: {}", e)))?,
        );
        Ok(self)
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// A call in progress; retried at most once
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub path: String,
    pub options: RequestOptions,
    pub retry_attempted: bool,
}

impl PendingRequest {
    pub fn new(path: impl Into<String>, options: RequestOptions) -> Self {
        Self {
            path: path.into(),
            options,
            retry_attempted: false,
        }
    }
}

#[derive(Clone)]
pub struct AuthorizedRequestClient {
    client: Client,
    config: RequestClientConfig,
    session: SessionContext,
}

impl AuthorizedRequestClient {
    pub fn new(
        config: RequestClientConfig,
        client_config: &HttpClientConfig,
        session: SessionContext,
    ) -> Result<Self> {
        Ok(Self::with_client(create_client(client_config)?, config, session))
    }

    pub fn with_client(client: Client, config: RequestClientConfig, session: SessionContext) -> Self {
        Self {
            client,
            config,
            session,
        }
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    #[instrument(skip(self, options), fields(method = %options.method))]
    pub async fn request<T: DeserializeOwned>(&self, path: &str, options: RequestOptions) -> Result<T> {
        let mut pending = PendingRequest::new(path, options);
        self.send(&mut pending, true).await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request(path, RequestOptions::get()).await
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.request(path, RequestOptions::new(Method::POST).with_json(body)?)
            .await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        pending: &mut PendingRequest,
        mut retry_allowed: bool,
    ) -> Result<T> {
        loop {
            let response = self.dispatch(pending).await?;

            if response.status() != StatusCode::UNAUTHORIZED || !retry_allowed {
                return read_response(response).await;
            }

            debug!(path = %pending.path, "Access token rejected, refreshing before retry");
            let lifecycle = self.session.lifecycle();
            if let Err(e) = lifecycle.refresh().await {
                if e.is_unauthorized() {
                    warn!("Session can no longer be refreshed, signing out: {}", e);
                    lifecycle.sign_out();
                }
                return Err(e.into());
            }

            pending.retry_attempted = true;
            retry_allowed = false;
        }
    }

    async fn dispatch(&self, pending: &PendingRequest) -> Result<reqwest::Response> {
        // Checked on every attempt, before touching the network
        let tenant = self
            .session
            .tenant_slug()
            .ok_or(RequestError::TenantContextMissing)?;

        let url = join_url(&self.config.base_url, &pending.path)?;
        let mut builder = self
            .client
            .request(pending.options.method.clone(), &url)
            .headers(pending.options.headers.clone())
            .header(self.config.tenant_header.as_str(), tenant.as_str());

        if let Some(access_token) = self.session.store().access_token() {
            builder = builder.bearer_auth(access_token);
        }
        if let Some(body) = &pending.options.body {
            builder = builder.json(body);
        }

        debug!(
            url = %url,
            tenant = %tenant,
            retry = pending.retry_attempted,
            "Sending authorized request"
        );
        Ok(builder.send().await?)
    }
}
