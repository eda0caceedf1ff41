use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use utoipa::ToSchema;

/// Response structure for API errors
///
/// Every failure leaving the service is rendered as this JSON body, so clients
/// can parse responses unconditionally.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// A human-readable error message describing what went wrong
    pub error: String,
    /// A machine-readable error code string (e.g., "INVALID_REQUEST")
    pub code: String,
    /// Diagnostic payload for errors that carry one
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub debug: Option<Value>,
}

/// Represents all possible errors that can occur while handling a generation
#[derive(Debug, Error)]
pub enum MediaGenError {
    /// The caller's request is missing a required field or is malformed
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// The route does not accept the HTTP method used
    #[error("Method not allowed: {method}")]
    MethodNotAllowed { method: String },

    /// No route matches the request path
    #[error("Not found: {path}")]
    NotFound { path: String },

    /// The request body exceeds the configured size limit
    #[error("Payload too large: {message}")]
    PayloadTooLarge { message: String },

    /// The provider could not be reached after exhausting retries
    #[error("Provider unavailable after {attempts} attempt(s): {message}")]
    ProviderUnavailable { attempts: u32, message: String },

    /// The provider permanently rejected the job
    #[error("Provider rejected the request: {message}")]
    ProviderRejected {
        status: Option<u16>,
        message: String,
    },

    /// The provider returned an output in a shape that cannot be materialized
    #[error("Unrecognized provider output shape: {observed_type}")]
    UnrecognizedOutputShape {
        observed_type: String,
        matched_checks: Vec<String>,
    },

    /// The generated artifact could not be downloaded from the provider
    #[error("Artifact download failed: {message}")]
    ArtifactDownloadFailed {
        status: Option<u16>,
        message: String,
    },

    /// The storage backend rejected the upload
    #[error("Storage upload failed for {path}: {message}")]
    StorageUploadFailed { path: String, message: String },

    /// Webhook mode is enabled but no callback URL is configured
    #[error("Callback misconfigured: {message}")]
    MisconfiguredCallback { message: String },

    /// A provider callback arrived without the routing metadata
    #[error("Missing callback metadata: {field}")]
    MissingCallbackMetadata { field: String },

    /// The reference row for a materialized artifact could not be written
    #[error("Failed to record artifact reference: {message}")]
    ReferenceRecordFailed { message: String },

    /// Error returned for unexpected internal server errors
    #[error("Internal server error: {message}")]
    InternalError { message: String },
}

impl MediaGenError {
    /// Returns the machine-readable error code for this error type
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "INVALID_REQUEST",
            Self::MethodNotAllowed { .. } => "METHOD_NOT_ALLOWED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::ProviderUnavailable { .. } => "PROVIDER_UNAVAILABLE",
            Self::ProviderRejected { .. } => "PROVIDER_REJECTED",
            Self::UnrecognizedOutputShape { .. } => "UNRECOGNIZED_OUTPUT_SHAPE",
            Self::ArtifactDownloadFailed { .. } => "ARTIFACT_DOWNLOAD_FAILED",
            Self::StorageUploadFailed { .. } => "STORAGE_UPLOAD_FAILED",
            Self::MisconfiguredCallback { .. } => "MISCONFIGURED_CALLBACK",
            Self::MissingCallbackMetadata { .. } => "MISSING_CALLBACK_METADATA",
            Self::ReferenceRecordFailed { .. } => "REFERENCE_RECORD_FAILED",
            Self::InternalError { .. } => "INTERNAL_ERROR",
        }
    }

    /// Returns a user-friendly error message for API responses
    ///
    /// Configuration and storage details stay in the logs; clients get a
    /// short description of which stage failed.
    fn client_message(&self) -> String {
        match self {
            Self::MisconfiguredCallback { .. } => {
                "Video generation callback is not configured".to_string()
            }
            Self::StorageUploadFailed { .. } => "Failed to store generated media".to_string(),
            Self::ReferenceRecordFailed { .. } => {
                "Failed to record generated media reference".to_string()
            }
            Self::InternalError { .. } => "Internal server error occurred".to_string(),
            other => other.to_string(),
        }
    }

    /// Returns the HTTP status code associated with this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } | Self::MissingCallbackMetadata { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ProviderUnavailable { .. }
            | Self::ProviderRejected { .. }
            | Self::ArtifactDownloadFailed { .. } => StatusCode::BAD_GATEWAY,
            Self::UnrecognizedOutputShape { .. }
            | Self::StorageUploadFailed { .. }
            | Self::MisconfiguredCallback { .. }
            | Self::ReferenceRecordFailed { .. }
            | Self::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the diagnostic payload attached to the response, if any
    fn debug(&self) -> Option<Value> {
        match self {
            Self::UnrecognizedOutputShape {
                observed_type,
                matched_checks,
            } => Some(json!({
                "observedType": observed_type,
                "matchedChecks": matched_checks,
            })),
            Self::ArtifactDownloadFailed { status, .. } => {
                Some(json!({ "upstreamStatus": status }))
            }
            Self::ProviderRejected { status, .. } => Some(json!({ "upstreamStatus": status })),
            Self::ProviderUnavailable { attempts, .. } => Some(json!({ "attempts": attempts })),
            _ => None,
        }
    }
}

impl IntoResponse for MediaGenError {
    fn into_response(self) -> Response {
        tracing::error!(
            target = "mediagen-service",
            event = "error_occurred",
            code = self.error_code(),
            error = %self,
        );
        let error_response = ErrorResponse {
            error: self.client_message(),
            code: self.error_code().to_string(),
            debug: self.debug(),
        };
        (self.status_code(), Json(error_response)).into_response()
    }
}
