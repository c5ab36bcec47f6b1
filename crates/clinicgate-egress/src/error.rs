//! Error types for ClinicGate Egress

use clinicgate_core::classify::{
    ClassifiedError, FailureShape, classify_failure, classify_provider_code, classify_status,
};
use clinicgate_session::RefreshError;
use thiserror::Error;

use crate::envelope::FieldError;

#[derive(Debug, Error)]
pub enum RequestError {
    /// The backend answered with a `success: false` envelope
    #[error("API error (status {status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
        field_errors: Vec<FieldError>,
    },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("No tenant context for this request")]
    TenantContextMissing,

    #[error("Credential refresh failed: {0}")]
    Refresh(#[from] RefreshError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RequestError>;

impl RequestError {
    /// HTTP status behind the error, if one was received
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::Api { status, .. } | RequestError::Status { status, .. } => {
                Some(*status)
            }
            RequestError::Unauthorized(_) => Some(401),
            RequestError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Map into the user-facing taxonomy
    pub fn classify(&self) -> ClassifiedError {
        match self {
            RequestError::Api { code: Some(code), .. } => classify_provider_code(code),
            RequestError::Api { status, .. } | RequestError::Status { status, .. } => {
                classify_status(*status)
            }
            RequestError::Unauthorized(_) => classify_status(401),
            RequestError::TenantContextMissing => {
                classify_failure(&FailureShape::TenantContextMissing)
            }
            RequestError::Refresh(RefreshError::CoolingDown { .. }) => classify_status(503),
            RequestError::Refresh(e) if e.is_unauthorized() => classify_status(401),
            RequestError::Refresh(RefreshError::Failed(api) | RefreshError::Rejected(api)) => {
                match api.status() {
                    Some(status) => classify_status(status),
                    None => classify_failure(&FailureShape::Network),
                }
            }
            RequestError::Refresh(_) => classify_failure(&FailureShape::Network),
            RequestError::Http(e) if e.is_timeout() => classify_failure(&FailureShape::Timeout),
            RequestError::Http(e) => match e.status() {
                Some(status) => classify_status(status.as_u16()),
                None => classify_failure(&FailureShape::Network),
            },
            RequestError::Parse(_) | RequestError::Config(_) => classify_status(500),
        }
    }
}
