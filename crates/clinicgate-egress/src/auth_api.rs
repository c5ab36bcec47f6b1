//! HTTP implementation of the auth backend contract

use async_trait::async_trait;
use clinicgate_session::{AuthApi, AuthApiError, Credentials, Profile, TokenSet};
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::client::{HttpClientConfig, create_client, join_url};
use crate::envelope::read_response;
use crate::{RequestError, Result};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshBody<'a> {
    refresh_token: &'a str,
}

/// Talks to `/auth/*` on the clinic backend
#[derive(Clone)]
pub struct HttpAuthApi {
    client: Client,
    base_url: String,
}

impl HttpAuthApi {
    pub fn new(base_url: impl Into<String>, client_config: &HttpClientConfig) -> Result<Self> {
        Ok(Self::with_client(create_client(client_config)?, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = join_url(&self.base_url, path)?;
        debug!(url = %url, "POST");
        let response = self.client.post(&url).json(body).send().await?;
        read_response(response).await
    }
}

fn to_auth_error(err: RequestError) -> AuthApiError {
    match err {
        RequestError::Unauthorized(message)
        | RequestError::Api {
            status: 401,
            message,
            ..
        } => AuthApiError::Unauthorized(message),
        RequestError::Api {
            status, message, ..
        } => AuthApiError::Status { status, message },
        RequestError::Status { status, body } => AuthApiError::Status {
            status,
            message: body,
        },
        RequestError::Http(e) if e.is_timeout() => AuthApiError::Timeout,
        RequestError::Http(e) => AuthApiError::Network(e.to_string()),
        RequestError::Parse(message) => AuthApiError::InvalidResponse(message),
        other => AuthApiError::InvalidResponse(other.to_string()),
    }
}

#[async_trait]
impl AuthApi for HttpAuthApi {
    #[instrument(skip(self, credentials), fields(email = %credentials.email))]
    async fn login(&self, credentials: &Credentials) -> std::result::Result<TokenSet, AuthApiError> {
        self.post_json("/auth/login", credentials)
            .await
            .map_err(to_auth_error)
    }

    #[instrument(skip_all)]
    async fn refresh(&self, refresh_token: &str) -> std::result::Result<TokenSet, AuthApiError> {
        self.post_json("/auth/refresh", &RefreshBody { refresh_token })
            .await
            .map_err(to_auth_error)
    }

    #[instrument(skip_all)]
    async fn logout(&self, refresh_token: &str) -> std::result::Result<(), AuthApiError> {
        let url = join_url(&self.base_url, "/auth/logout").map_err(to_auth_error)?;
        let response = self
            .client
            .post(&url)
            .json(&RefreshBody { refresh_token })
            .send()
            .await
            .map_err(|e| to_auth_error(e.into()))?;

        // The body, if any, carries nothing we need
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.bytes().await.unwrap_or_default();
        Err(to_auth_error(crate::envelope::error_from_body(
            status.as_u16(),
            &body,
        )))
    }

    #[instrument(skip_all)]
    async fn profile(&self, access_token: &str) -> std::result::Result<Profile, AuthApiError> {
        let url = join_url(&self.base_url, "/auth/profile").map_err(to_auth_error)?;
        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| to_auth_error(e.into()))?;
        read_response(response).await.map_err(to_auth_error)
    }
}
