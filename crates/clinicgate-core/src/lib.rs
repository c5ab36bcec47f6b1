//! ClinicGate Core Types and Traits
//!
//! This crate provides the fundamental types shared by every ClinicGate crate:
//! - Tenant identity and the tenant directory abstraction
//! - Cookie-equivalent persisted state
//! - Error classification for user-facing failures
//! - Core error types

pub mod classify;
pub mod cookie;
pub mod error;
pub mod tenant;

pub use error::{Error, Result};
