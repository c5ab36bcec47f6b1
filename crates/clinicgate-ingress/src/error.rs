//! Ingress error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    /// Tenant directory lookup failed
    #[error("Tenant lookup failed: {0}")]
    TenantLookup(#[from] clinicgate_core::Error),

    /// A computed URL or header could not be represented
    #[error("Invalid redirect target: {0}")]
    InvalidRedirect(String),

    #[error("Invalid tenant configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            IngressError::TenantLookup(_) => (StatusCode::SERVICE_UNAVAILABLE, "tenant_lookup_failed"),
            IngressError::InvalidRedirect(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            IngressError::InvalidConfig(_) | IngressError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };

        let body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": kind,
                "code": status.as_u16(),
            }
        });

        (status, axum::Json(body)).into_response()
    }
}

pub type IngressResult<T> = Result<T, IngressError>;
