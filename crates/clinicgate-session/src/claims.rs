//! Access credential claim decoding
//!
//! Decoding is a pure function of the credential's raw bytes. Where the bytes
//! come from (a client-side jar or a server request's `Cookie` header) is up
//! to the caller. Signatures are not verified here; the backend does that.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::api::Identity;
use crate::error::{Result, SessionError};

/// Claims read from an access credential payload
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Claims {
    /// Expiry, seconds since the epoch
    #[serde(default)]
    pub exp: Option<f64>,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl Claims {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let exp = self.exp?;
        if !exp.is_finite() {
            return None;
        }
        Utc.timestamp_opt(exp.trunc() as i64, 0).single()
    }

    /// Identity carried by the credential, if it names an email
    pub fn identity(&self) -> Option<Identity> {
        let email = self.email.clone()?;
        Some(Identity {
            name: self.name.clone().unwrap_or_else(|| email.clone()),
            role: self.role.clone().unwrap_or_default(),
            email,
        })
    }
}

/// Decode the payload segment of a compact JWS (`header.payload.signature`)
pub fn decode_claims(token: &[u8]) -> Result<Claims> {
    let mut segments = token.split(|b| *b == b'.');
    let (Some(_header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(SessionError::InvalidCredential(
            "expected three dot-separated segments".to_string(),
        ));
    };

    // Some issuers pad the segments even though JWS forbids it
    let payload = trim_padding(payload);
    if payload.is_empty() {
        return Err(SessionError::InvalidCredential(
            "empty payload segment".to_string(),
        ));
    }

    let bytes = URL_SAFE_NO_PAD.decode(payload).map_err(|e| {
        SessionError::InvalidCredential(format!("payload is not base64url: {}", e))
    })?;

    serde_json::from_slice(&bytes)
        .map_err(|e| SessionError::InvalidCredential(format!("payload is not JSON claims: {}", e)))
}

fn trim_padding(segment: &[u8]) -> &[u8] {
    let end = segment
        .iter()
        .rposition(|b| *b != b'=')
        .map_or(0, |idx| idx + 1);
    &segment[..end]
}
