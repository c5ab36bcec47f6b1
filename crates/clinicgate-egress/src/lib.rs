//! ClinicGate Egress
//!
//! Outbound calls to the clinic backend:
//! - Shared HTTP client configuration
//! - Response envelope decoding
//! - `HttpAuthApi`, the reqwest implementation of the auth contract
//! - `AuthorizedRequestClient`, which attaches credentials and tenant and
//!   recovers from an expired access credential once per request

pub mod auth_api;
pub mod client;
pub mod envelope;
pub mod error;
pub mod request;

pub use auth_api::HttpAuthApi;
pub use client::{HttpClientConfig, create_client, join_url};
pub use envelope::{Envelope, FieldError};
pub use error::{RequestError, Result};
pub use request::{AuthorizedRequestClient, PendingRequest, RequestClientConfig, RequestOptions};
