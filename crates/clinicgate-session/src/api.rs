//! Auth backend contract
//!
//! The lifecycle manager talks to the auth backend only through [`AuthApi`];
//! the HTTP implementation lives in `clinicgate-egress`.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use thiserror::Error;

/// Sign-in credentials
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Token pair returned by login and refresh
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,

    /// Server-supplied expiry of the access credential
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub access_expires_at: Option<DateTime<Utc>>,

    /// Server-supplied expiry of the refresh credential
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub refresh_expires_at: Option<DateTime<Utc>>,
}

impl TokenSet {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            access_expires_at: None,
            refresh_expires_at: None,
        }
    }
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token_len", &self.access_token.len())
            .field("refresh_token_len", &self.refresh_token.len())
            .field("access_expires_at", &self.access_expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .finish()
    }
}

/// `GET /auth/profile` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub email: String,
    pub full_name: String,
    pub role: String,
}

/// Who the session belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub email: String,
    pub name: String,
    pub role: String,
}

impl From<Profile> for Identity {
    fn from(profile: Profile) -> Self {
        Self {
            email: profile.email,
            name: profile.full_name,
            role: profile.role,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum AuthApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Auth API returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl AuthApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, AuthApiError::Unauthorized(_))
    }

    /// HTTP status behind the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            AuthApiError::Unauthorized(_) => Some(401),
            AuthApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Auth backend operations
#[async_trait]
pub trait AuthApi: Send + Sync {
    /// `POST /auth/login`
    async fn login(&self, credentials: &Credentials) -> Result<TokenSet, AuthApiError>;

    /// `POST /auth/refresh`
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, AuthApiError>;

    /// `POST /auth/logout`
    async fn logout(&self, refresh_token: &str) -> Result<(), AuthApiError>;

    /// `GET /auth/profile`
    async fn profile(&self, access_token: &str) -> Result<Profile, AuthApiError>;
}

/// Accept RFC 3339 strings, epoch seconds or epoch milliseconds
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Text(text)) => DateTime::parse_from_rfc3339(&text)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| D::Error::custom(format!("invalid timestamp '{}': {}", text, e))),
        Some(Raw::Number(n)) => {
            // Values past year 33658 in seconds are taken as milliseconds
            let parsed = if n.abs() >= 1_000_000_000_000 {
                Utc.timestamp_millis_opt(n).single()
            } else {
                Utc.timestamp_opt(n, 0).single()
            };
            parsed
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("timestamp {} out of range", n)))
        }
    }
}
