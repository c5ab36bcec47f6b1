//! Response envelope decoding
//!
//! The backend wraps most payloads as
//! `{ success, code, message, data, errors }`. Some endpoints answer with a
//! bare payload instead, so decoding accepts both: a JSON object carrying a
//! boolean `success` is treated as an envelope, anything else as the payload.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{RequestError, Result};

/// One field-level validation failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(default, deserialize_with = "deserialize_code")]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<T>,
    #[serde(default)]
    pub errors: Option<Vec<FieldError>>,
}

impl<T> Envelope<T> {
    /// Convert a failed envelope into [`RequestError::Api`]
    pub fn into_error(self, status: u16) -> RequestError {
        RequestError::Api {
            status,
            message: self
                .message
                .or_else(|| self.code.clone())
                .unwrap_or_else(|| "Request failed".to_string()),
            code: self.code,
            field_errors: self.errors.unwrap_or_default(),
        }
    }
}

fn is_envelope(value: &Value) -> bool {
    value.get("success").is_some_and(Value::is_boolean)
}

/// Decode a successful response body, enveloped or bare
pub fn decode_body<T: DeserializeOwned>(status: u16, body: &[u8]) -> Result<T> {
    let value: Value = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(body)
            .map_err(|e| RequestError::Parse(format!("Response is not JSON: {}", e)))?
    };

    let payload = if is_envelope(&value) {
        let envelope: Envelope<Value> = serde_json::from_value(value)
            .map_err(|e| RequestError::Parse(format!("Malformed envelope: {}", e)))?;
        if !envelope.success {
            return Err(envelope.into_error(status));
        }
        envelope.data.unwrap_or(Value::Null)
    } else {
        value
    };

    serde_json::from_value(payload)
        .map_err(|e| RequestError::Parse(format!("Unexpected response shape: {}", e)))
}

/// Build the error for a non-success HTTP status
pub fn error_from_body(status: u16, body: &[u8]) -> RequestError {
    let envelope = serde_json::from_slice::<Envelope<Value>>(body).ok();
    let text = String::from_utf8_lossy(body).into_owned();

    match (status, envelope) {
        (401, Some(envelope)) => RequestError::Unauthorized(
            envelope
                .message
                .unwrap_or_else(|| "Unauthorized".to_string()),
        ),
        (401, None) => RequestError::Unauthorized(text),
        (_, Some(envelope)) => envelope.into_error(status),
        (_, None) => RequestError::Status { status, body: text },
    }
}

/// Read a response to completion and decode it
pub async fn read_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.bytes().await?;

    if !status.is_success() {
        debug!(status = status.as_u16(), "Request failed");
        return Err(error_from_body(status.as_u16(), &body));
    }
    decode_body(status.as_u16(), &body)
}

/// Codes come as strings from most endpoints and as numbers from a few
fn deserialize_code<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(code)) => Some(code),
        Some(Value::Number(code)) => Some(code.to_string()),
        _ => None,
    })
}
