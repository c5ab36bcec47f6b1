//! Error classification
//!
//! Maps raw failures (HTTP status codes, provider error codes, failure shapes)
//! into a closed taxonomy. Every classified error carries a retry policy and
//! a redirect target, and knows how it should be logged and shown.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

/// Delay before an error page sends the user on
pub const AUTO_REDIRECT_DELAY: Duration = Duration::from_secs(5);

/// Manual retries offered before the user is sent back to sign-in
pub const MAX_MANUAL_RETRIES: u32 = 3;

/// Closed error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UserCancelled,
    NetworkError,
    Timeout,
    InvalidState,
    InvalidRequest,
    TenantNotFound,
    TenantContextMissing,
    ProviderUnavailable,
    ProviderError,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UserCancelled => "user_cancelled",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::TenantNotFound => "tenant_not_found",
            ErrorKind::TenantContextMissing => "tenant_context_missing",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::ProviderError => "provider_error",
            ErrorKind::Unknown => "unknown",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkError | ErrorKind::Timeout | ErrorKind::ProviderUnavailable
        )
    }

    /// Security-sensitive kinds are always logged at error level
    pub fn is_security_sensitive(&self) -> bool {
        matches!(self, ErrorKind::InvalidState | ErrorKind::InvalidRequest)
    }

    pub fn redirect_target(&self) -> RedirectTarget {
        match self {
            ErrorKind::NetworkError | ErrorKind::Timeout | ErrorKind::ProviderUnavailable => {
                RedirectTarget::Stay
            }
            ErrorKind::UserCancelled
            | ErrorKind::InvalidState
            | ErrorKind::InvalidRequest
            | ErrorKind::ProviderError => RedirectTarget::SignIn,
            ErrorKind::TenantNotFound => RedirectTarget::NotFound,
            ErrorKind::TenantContextMissing | ErrorKind::Unknown => RedirectTarget::Home,
        }
    }

    fn user_message(&self) -> &'static str {
        match self {
            ErrorKind::UserCancelled => "Sign-in was cancelled.",
            ErrorKind::NetworkError => "We could not reach the server. Check your connection.",
            ErrorKind::Timeout => "The server took too long to respond.",
            ErrorKind::InvalidState | ErrorKind::InvalidRequest => {
                "Your sign-in request could not be verified. Please sign in again."
            }
            ErrorKind::TenantNotFound => "This clinic could not be found.",
            ErrorKind::TenantContextMissing => "We could not tell which clinic you are visiting.",
            ErrorKind::ProviderUnavailable => "The sign-in provider is temporarily unavailable.",
            ErrorKind::ProviderError | ErrorKind::Unknown => "Something went wrong.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the user is sent after an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectTarget {
    /// Stay on the current page (retry in place)
    Stay,
    SignIn,
    Home,
    NotFound,
}

/// Shape of a failure that has no status or provider code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureShape {
    /// Transport-level failure (connect, DNS, reset)
    Network,
    /// Transport-level timeout
    Timeout,
    /// A required parameter was absent
    MissingParameter(String),
    /// No tenant could be associated with the operation
    TenantContextMissing,
}

/// A failure mapped into the taxonomy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub redirect_to: RedirectTarget,
    /// Raw input that produced the classification, for logs
    pub detail: String,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: kind.is_retryable(),
            redirect_to: kind.redirect_target(),
            detail: detail.into(),
        }
    }

    /// Emit a log line at the severity the kind calls for
    pub fn log(&self) {
        if self.kind.is_security_sensitive() {
            error!(
                target: "security",
                kind = %self.kind,
                retryable = self.retryable,
                "Security-sensitive failure: {}",
                self.detail
            );
        } else if self.kind == ErrorKind::UserCancelled {
            info!(kind = %self.kind, "User cancelled: {}", self.detail);
        } else {
            warn!(
                kind = %self.kind,
                retryable = self.retryable,
                "Request failed: {}",
                self.detail
            );
        }
    }

    /// How the failure should be shown to the user
    pub fn presentation(&self) -> Presentation {
        if self.kind == ErrorKind::UserCancelled {
            return Presentation {
                kind: self.kind,
                tone: Tone::Neutral,
                message: self.kind.user_message().to_string(),
                auto_redirect: None,
                max_manual_retries: 0,
            };
        }

        let auto_redirect = match self.redirect_to {
            RedirectTarget::Stay => None,
            target => Some(AutoRedirect {
                target,
                after_secs: AUTO_REDIRECT_DELAY.as_secs(),
            }),
        };

        Presentation {
            kind: self.kind,
            tone: Tone::Error,
            message: self.kind.user_message().to_string(),
            auto_redirect,
            max_manual_retries: MAX_MANUAL_RETRIES,
        }
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

/// Classify an HTTP status code
pub fn classify_status(status: u16) -> ClassifiedError {
    let kind = match status {
        400 | 422 => ErrorKind::InvalidRequest,
        401 | 403 => ErrorKind::InvalidState,
        408 | 504 => ErrorKind::Timeout,
        429 | 502 | 503 => ErrorKind::ProviderUnavailable,
        500..=599 => ErrorKind::ProviderError,
        _ => ErrorKind::Unknown,
    };
    ClassifiedError::new(kind, format!("HTTP status {}", status))
}

/// Classify a provider-supplied error code (for example an OAuth `error` parameter)
pub fn classify_provider_code(code: &str) -> ClassifiedError {
    let normalized = code.trim().to_ascii_lowercase();
    let kind = match normalized.as_str() {
        "" => ErrorKind::Unknown,
        "access_denied" | "user_cancelled" | "cancelled" | "canceled" => ErrorKind::UserCancelled,
        "invalid_state" | "state_mismatch" => ErrorKind::InvalidState,
        "invalid_request" | "invalid_grant" | "missing_parameter" => ErrorKind::InvalidRequest,
        "tenant_not_found" => ErrorKind::TenantNotFound,
        "tenant_context_missing" | "missing_tenant" => ErrorKind::TenantContextMissing,
        "temporarily_unavailable" | "service_unavailable" => ErrorKind::ProviderUnavailable,
        "timeout" => ErrorKind::Timeout,
        "network_error" => ErrorKind::NetworkError,
        _ => ErrorKind::ProviderError,
    };
    ClassifiedError::new(kind, format!("provider code '{}'", code))
}

/// Classify a failure by its shape
pub fn classify_failure(shape: &FailureShape) -> ClassifiedError {
    match shape {
        FailureShape::Network => ClassifiedError::new(ErrorKind::NetworkError, "network failure"),
        FailureShape::Timeout => ClassifiedError::new(ErrorKind::Timeout, "request timed out"),
        FailureShape::MissingParameter(name) => ClassifiedError::new(
            ErrorKind::InvalidRequest,
            format!("missing parameter '{}'", name),
        ),
        FailureShape::TenantContextMissing => {
            ClassifiedError::new(ErrorKind::TenantContextMissing, "no tenant context")
        }
    }
}

/// Visual tone of an error page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Neutral,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AutoRedirect {
    pub target: RedirectTarget,
    pub after_secs: u64,
}

/// User-visible rendering of a classified error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Presentation {
    pub kind: ErrorKind,
    pub tone: Tone,
    pub message: String,
    pub auto_redirect: Option<AutoRedirect>,
    pub max_manual_retries: u32,
}

/// Outcome of asking for another manual retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { remaining: u32 },
    ForceSignIn,
}

/// Caps manual retries from an error page
#[derive(Debug, Clone)]
pub struct RetryBudget {
    max_attempts: u32,
    used: u32,
}

impl RetryBudget {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            used: 0,
        }
    }

    /// Resume a budget from an attempt count carried by the client
    pub fn resume(max_attempts: u32, used: u32) -> Self {
        Self {
            max_attempts,
            used: used.min(max_attempts),
        }
    }

    pub fn attempts_used(&self) -> u32 {
        self.used
    }

    pub fn try_consume(&mut self) -> RetryDecision {
        if self.used >= self.max_attempts {
            return RetryDecision::ForceSignIn;
        }
        self.used += 1;
        RetryDecision::Retry {
            remaining: self.max_attempts - self.used,
        }
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new(MAX_MANUAL_RETRIES)
    }
}
