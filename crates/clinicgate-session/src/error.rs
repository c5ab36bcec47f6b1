//! Error types for ClinicGate Session

use std::time::Duration;
use thiserror::Error;

use crate::api::AuthApiError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Auth API error: {0}")]
    Api(#[from] AuthApiError),

    #[error("Refresh failed: {0}")]
    Refresh(#[from] RefreshError),

    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Not authenticated")]
    NotAuthenticated,
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Outcome of a failed refresh.
///
/// Cloneable because one refresh result is shared by every caller that
/// joined the same in-flight attempt.
#[derive(Debug, Clone, Error)]
pub enum RefreshError {
    #[error("Refresh cooling down after a recent failure ({}ms left)", remaining.as_millis())]
    CoolingDown { remaining: Duration },

    #[error("No refresh token available")]
    MissingRefreshToken,

    #[error("Refresh token rejected: {0}")]
    Rejected(AuthApiError),

    #[error("Refresh request failed: {0}")]
    Failed(AuthApiError),

    #[error("Refresh task aborted: {0}")]
    Aborted(String),

    #[error("Session ended while the refresh was in flight")]
    Superseded,
}

impl RefreshError {
    /// True when the refresh credential itself is no longer usable
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            RefreshError::Rejected(_)
                | RefreshError::MissingRefreshToken
                | RefreshError::Superseded
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_error_display() {
        let err = RefreshError::CoolingDown {
            remaining: Duration::from_millis(1500),
        };
        assert_eq!(
            err.to_string(),
            "Refresh cooling down after a recent failure (1500ms left)"
        );

        let err = RefreshError::Rejected(AuthApiError::Unauthorized("expired".to_string()));
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_refresh_error_unauthorized() {
        assert!(RefreshError::MissingRefreshToken.is_unauthorized());
        assert!(RefreshError::Superseded.is_unauthorized());
        assert!(
            RefreshError::Rejected(AuthApiError::Unauthorized("x".to_string())).is_unauthorized()
        );
        assert!(
            !RefreshError::Failed(AuthApiError::Network("reset".to_string())).is_unauthorized()
        );
        assert!(
            !RefreshError::CoolingDown {
                remaining: Duration::from_secs(1)
            }
            .is_unauthorized()
        );
    }
}
