//! ClinicGate Ingress
//!
//! Request-side tenant handling:
//! - `TenantResolver`, the per-request tenant resolution algorithm
//! - Locale path normalization
//! - `tenant_middleware`, which applies a resolution to an axum request

pub mod error;
pub mod locale;
pub mod middleware;
pub mod resolver;

pub use error::{IngressError, IngressResult};
pub use locale::LocaleConfig;
pub use middleware::tenant_middleware;
pub use resolver::{Resolution, TenantConfig, TenantResolver};
