use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, State},
    Json,
};
use opentelemetry::KeyValue;
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};
use utoipa::OpenApi;

use crate::{
    config::ReferenceRowPolicy,
    error::{ErrorResponse, MediaGenError},
    handlers::{metrics::CALLBACKS_RECEIVED, parse_json_body},
    materializer::resolve_output,
    provider::{META_KEY, META_SUBJECT_ID_KEY, META_USER_ID_KEY},
    server::AppState,
    types::{CallbackPayload, CallbackResponse, GenerationKind, PendingJob, ProviderOutput},
};

/// The path the provider posts completed jobs to
pub const CALLBACK_PATH: &str = "/api/generate/callback";

/// The only job status that carries an output to materialize
const SUCCEEDED_STATUS: &str = "succeeded";

/// Model parameter naming the requested output format
const OUTPUT_FORMAT_KEY: &str = "output_format";

/// OpenAPI documentation for the callback endpoint.
#[derive(OpenApi)]
#[openapi(
    paths(callback_handler),
    components(schemas(CallbackPayload, CallbackResponse, ErrorResponse))
)]
pub struct CallbackOpenApi;

fn meta_field(input: &Value, field: &str) -> Result<String, MediaGenError> {
    input
        .get(META_KEY)
        .and_then(|meta| meta.get(field))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| MediaGenError::MissingCallbackMetadata {
            field: format!("{META_KEY}.{field}"),
        })
}

/// Complete an asynchronous generation
///
/// Called by the provider when a webhook job finishes. Successful jobs are
/// stored under the user and character named in the echoed `_meta` entry;
/// any other status is acknowledged without work so the provider does not
/// redeliver it.
#[utoipa::path(
    post,
    path = "",
    tag = "generate",
    request_body = CallbackPayload,
    responses(
        (status = OK, description = "Callback processed or ignored", body = CallbackResponse),
        (status = BAD_REQUEST, description = "Malformed payload or missing metadata", body = ErrorResponse),
        (status = PAYLOAD_TOO_LARGE, description = "Payload over the size limit", body = ErrorResponse),
        (status = INTERNAL_SERVER_ERROR, description = "Materialization failed", body = ErrorResponse)
    )
)]
#[instrument(level = "info", skip_all, fields(path = CALLBACK_PATH))]
pub async fn callback_handler(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<CallbackResponse>, MediaGenError> {
    let payload: CallbackPayload = parse_json_body(body)?;
    let status = payload
        .status
        .as_deref()
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    CALLBACKS_RECEIVED.add(1, &[KeyValue::new("status", status.clone())]);

    if status != SUCCEEDED_STATUS {
        info!(
            target = "mediagen-service",
            event = "callback_ignored",
            job_id = payload.id.as_deref().unwrap_or_default(),
            status = %status,
            "Acknowledged callback without a result"
        );
        return Ok(Json(CallbackResponse {
            ok: true,
            ignored: Some(status),
            path: None,
            url: None,
            prediction_id: payload.id,
        }));
    }

    let user_id = meta_field(&payload.input, META_USER_ID_KEY)?;
    let subject_id = meta_field(&payload.input, META_SUBJECT_ID_KEY)?;
    let kind = GenerationKind::Video;

    let result = resolve_output(&ProviderOutput::Json(payload.output), kind)?;
    let output_format = payload
        .input
        .get(OUTPUT_FORMAT_KEY)
        .and_then(Value::as_str);
    let artifact = state
        .materializer
        .materialize(result, kind, &user_id, &subject_id, output_format)
        .await?;

    if let Some(recorder) = &state.recorder {
        let mut original_parameters = match &payload.input {
            Value::Object(input) => input.clone(),
            _ => Map::new(),
        };
        original_parameters.remove(META_KEY);
        let job = PendingJob {
            job_id: payload.id.clone().unwrap_or_default(),
            user_id,
            subject_id,
            original_parameters,
        };
        if let Err(e) = recorder.record(&job, &artifact).await {
            match state.reference_row_policy {
                ReferenceRowPolicy::Propagate => {
                    return Err(MediaGenError::ReferenceRecordFailed {
                        message: e.to_string(),
                    });
                }
                ReferenceRowPolicy::Swallow => {
                    warn!(
                        target = "mediagen-service",
                        event = "reference_record_failed",
                        job_id = %job.job_id,
                        error = %e,
                        "Stored artifact without a reference row"
                    );
                }
            }
        }
    }

    Ok(Json(CallbackResponse {
        ok: true,
        ignored: None,
        path: Some(artifact.storage_path),
        url: Some(artifact.public_url),
        prediction_id: payload.id,
    }))
}
