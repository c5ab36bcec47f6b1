//! ClinicGate Session
//!
//! Credential persistence and lifecycle for a signed-in user:
//! - Pure claim decoding for access credentials
//! - `SessionStore` over cookie-equivalent persisted state
//! - `TokenLifecycleManager` with proactive, single-flight refresh
//! - `SessionContext`, the bootstrap-time bundle injected into collaborators

pub mod api;
pub mod claims;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod store;

pub use api::{AuthApi, AuthApiError, Credentials, Identity, Profile, TokenSet};
pub use claims::{Claims, decode_claims};
pub use context::SessionContext;
pub use error::{RefreshError, Result, SessionError};
pub use lifecycle::{AuthState, LifecycleConfig, TokenLifecycleManager, compute_refresh_delay};
pub use store::{Session, SessionStore, SessionStoreConfig};
