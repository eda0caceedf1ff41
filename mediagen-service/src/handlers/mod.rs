pub mod callbacks;
pub mod generations;
pub mod metrics;

use std::any::Any;

use axum::{
    body::Bytes,
    extract::rejection::BytesRejection,
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use serde::de::DeserializeOwned;

use crate::error::MediaGenError;

/// Parses a JSON request body.
///
/// Bodies are taken as raw bytes so that malformed JSON and oversized bodies
/// are reported through [`MediaGenError`] rather than axum's plain-text
/// extractor rejections.
pub fn parse_json_body<T: DeserializeOwned>(
    body: Result<Bytes, BytesRejection>,
) -> Result<T, MediaGenError> {
    let body = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            MediaGenError::PayloadTooLarge {
                message: rejection.body_text(),
            }
        } else {
            MediaGenError::InvalidRequest {
                message: rejection.body_text(),
            }
        }
    })?;
    if body.is_empty() {
        return Err(MediaGenError::InvalidRequest {
            message: "request body is empty".to_string(),
        });
    }
    serde_json::from_slice(&body).map_err(|e| MediaGenError::InvalidRequest {
        message: format!("malformed JSON body: {e}"),
    })
}

/// Fallback for methods a route does not serve.
pub async fn method_not_allowed(method: Method) -> MediaGenError {
    MediaGenError::MethodNotAllowed {
        method: method.to_string(),
    }
}

/// Fallback for paths no route serves.
pub async fn not_found(uri: Uri) -> MediaGenError {
    MediaGenError::NotFound {
        path: uri.path().to_string(),
    }
}

/// Answers `OPTIONS` requests that do not carry CORS preflight headers.
/// Real preflights are answered by the CORS layer before reaching this.
pub async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Turns a handler panic into the usual JSON `500`.
pub fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else {
        "unknown panic".to_string()
    };
    MediaGenError::InternalError {
        message: format!("handler panicked: {message}"),
    }
    .into_response()
}
