//! JSON response envelope helpers.
//!
//! Every REST response uses the same envelope:
//! `{success, message?, error?, data?}`. On failure `error` and `message`
//! carry identical text - historical clients read one or the other and the
//! API treats them as synonyms.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;

/// The uniform REST envelope.
#[derive(Debug, Serialize)]
pub struct ApiEnvelope {
    /// Whether the request succeeded.
    pub success: bool,
    /// Informational or error text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Error text; synonym of `message` on failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Payload for successful requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// 200 with a data payload.
pub fn api_data(data: impl Serialize) -> Response {
    let data = serde_json::to_value(data).unwrap_or(Value::Null);
    Json(ApiEnvelope {
        success: true,
        message: None,
        error: None,
        data: Some(data),
    })
    .into_response()
}

/// 200 with a human-readable message and no payload.
pub fn api_ok(message: impl Into<String>) -> Response {
    Json(ApiEnvelope {
        success: true,
        message: Some(message.into()),
        error: None,
        data: None,
    })
    .into_response()
}

/// Failure with both `error` and `message` set to the same text.
pub fn api_error(status: StatusCode, text: impl Into<String>) -> Response {
    let text = text.into();
    (
        status,
        Json(ApiEnvelope {
            success: false,
            message: Some(text.clone()),
            error: Some(text),
            data: None,
        }),
    )
        .into_response()
}
