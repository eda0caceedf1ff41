use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use opentelemetry::KeyValue;
use serde_json::Value;
use tracing::{info, instrument};
use utoipa::OpenApi;

use crate::{
    config::VideoMode,
    error::{ErrorResponse, MediaGenError},
    handlers::{
        metrics::{
            GENERATION_LATENCY, GENERATION_NUM_REQUESTS, TOTAL_FAILED_GENERATION_REQUESTS,
        },
        parse_json_body,
    },
    materializer::resolve_output,
    normalizer::normalize,
    server::AppState,
    types::{
        GenerateAcceptedResponse, GenerateRequestBody, GenerateResponse, GenerationKind,
        GenerationRequest,
    },
};

/// The path for generation requests
pub const GENERATE_PATH: &str = "/api/generate";

/// Model parameter naming the requested output format
const OUTPUT_FORMAT_KEY: &str = "output_format";

/// Status reported for jobs handed to the provider's webhook
const PROCESSING_STATUS: &str = "processing";

/// OpenAPI documentation for the generation endpoint.
#[derive(OpenApi)]
#[openapi(
    paths(generate_handler),
    components(schemas(
        GenerateRequestBody,
        GenerateResponse,
        GenerateAcceptedResponse,
        GenerationKind,
        ErrorResponse
    ))
)]
pub struct GenerateOpenApi;

/// Generate an image or a video
///
/// Validates and normalizes the request against the configured model's input
/// contract, then either runs the model and stores the result (images, and
/// videos in `sync` mode) or submits it with a completion webhook and answers
/// `202` (videos in `webhook` mode).
#[utoipa::path(
    post,
    path = "",
    tag = "generate",
    request_body = GenerateRequestBody,
    responses(
        (status = OK, description = "Media generated and stored", body = GenerateResponse),
        (status = ACCEPTED, description = "Video submitted for asynchronous generation", body = GenerateAcceptedResponse),
        (status = BAD_REQUEST, description = "Invalid request", body = ErrorResponse),
        (status = PAYLOAD_TOO_LARGE, description = "Request body over the size limit", body = ErrorResponse),
        (status = BAD_GATEWAY, description = "Provider or download failure", body = ErrorResponse),
        (status = INTERNAL_SERVER_ERROR, description = "Internal server error", body = ErrorResponse)
    )
)]
#[instrument(level = "info", skip_all, fields(path = GENERATE_PATH))]
pub async fn generate_handler(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, MediaGenError> {
    let request_body: GenerateRequestBody = parse_json_body(body)?;
    let kind = request_body.kind.unwrap_or_default();
    match handle_generation(&state, request_body).await {
        Ok(response) => Ok(response),
        Err(e) => {
            TOTAL_FAILED_GENERATION_REQUESTS.add(
                1,
                &[
                    KeyValue::new("kind", kind.as_str()),
                    KeyValue::new("code", e.error_code()),
                ],
            );
            Err(e)
        }
    }
}

async fn handle_generation(
    state: &AppState,
    request_body: GenerateRequestBody,
) -> Result<Response, MediaGenError> {
    let request = GenerationRequest::try_from(request_body)?;
    let kind = request.kind;
    let model = state.model_for(kind);
    let spec = state
        .catalog
        .get(kind, model)
        .ok_or_else(|| MediaGenError::InternalError {
            message: format!("no input contract for {kind} model {model}"),
        })?;

    GENERATION_NUM_REQUESTS.add(
        1,
        &[
            KeyValue::new("kind", kind.as_str()),
            KeyValue::new("model", model.to_string()),
        ],
    );
    info!(
        target = "mediagen-service",
        event = "generation_requested",
        kind = %kind,
        model = %model,
        "Received generation request"
    );

    let normalized = normalize(&request, spec)?;

    if kind == GenerationKind::Video && state.video_mode == VideoMode::Webhook {
        let (_, pending) = state
            .invoker
            .submit(&normalized, &request.user_id, &request.subject_id)
            .await?;
        let response = GenerateAcceptedResponse {
            kind,
            status: PROCESSING_STATUS.to_string(),
            prediction_id: pending.job_id,
        };
        return Ok((StatusCode::ACCEPTED, Json(response)).into_response());
    }

    let _permit = state.gate.acquire().await?;
    let timer = Instant::now();

    let output = state.invoker.run(&normalized).await?;
    let result = resolve_output(&output, kind)?;
    let output_format = normalized
        .input
        .get(OUTPUT_FORMAT_KEY)
        .and_then(Value::as_str);
    let artifact = state
        .materializer
        .materialize(
            result,
            kind,
            &request.user_id,
            &request.subject_id,
            output_format,
        )
        .await?;

    let elapsed = timer.elapsed();
    GENERATION_LATENCY.record(
        elapsed.as_secs_f64(),
        &[
            KeyValue::new("kind", kind.as_str()),
            KeyValue::new("model", normalized.model.clone()),
        ],
    );
    info!(
        target = "mediagen-service",
        event = "generation_completed",
        path = %artifact.storage_path,
        elapsed_ms = elapsed.as_millis() as u64,
        "Generation stored"
    );

    Ok(Json(GenerateResponse {
        kind,
        path: artifact.storage_path,
        url: artifact.public_url,
        generation_time: elapsed.as_millis() as u64,
        model: normalized.model,
        used: normalized.input,
    })
    .into_response())
}
