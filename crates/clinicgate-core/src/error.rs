//! Error types for ClinicGate Core

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Multi-tenancy errors
    #[error("Invalid tenant: {0}")]
    InvalidTenant(String),

    #[error("Tenant required: {0}")]
    TenantRequired(String),

    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    // Persisted state errors
    #[error("Invalid cookie: {0}")]
    InvalidCookie(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
