use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
};
use tracing::{error, info};
use utoipa::OpenApi;

use crate::{
    components::openapi::openapi_routes,
    config::{ReferenceRowPolicy, VideoMode},
    gate::GenerationGate,
    handlers::{
        callbacks::{callback_handler, CALLBACK_PATH},
        generations::{generate_handler, GENERATE_PATH},
        handle_panic, method_not_allowed, not_found, preflight,
    },
    materializer::Materializer,
    models::ModelCatalog,
    provider::ProviderInvoker,
    recorder::ReferenceRecorder,
    types::GenerationKind,
};

/// The path for health check endpoint
pub const HEALTH_PATH: &str = "/health";

/// Represents the shared state of the application.
///
/// Every collaborator is built once at startup and handed to the handlers
/// through this state, which is cloned per request.
#[derive(Clone)]
pub struct AppState {
    /// Provider calls with retry and webhook submission
    pub invoker: ProviderInvoker,

    /// Download and upload of generated media
    pub materializer: Materializer,

    /// Per-model input contracts
    pub catalog: Arc<ModelCatalog>,

    /// Model used for image requests
    pub image_model: String,

    /// Model used for video requests
    pub video_model: String,

    /// Whether video requests wait for the provider or use the webhook
    pub video_mode: VideoMode,

    /// Bound on concurrent synchronous generations
    pub gate: GenerationGate,

    /// Writes reference rows for videos completed through the callback
    pub recorder: Option<Arc<dyn ReferenceRecorder>>,

    /// What to do when the reference row cannot be written
    pub reference_row_policy: ReferenceRowPolicy,

    /// Largest request body the generation and callback routes accept
    pub max_body_bytes: usize,
}

impl AppState {
    /// The configured model for `kind`
    pub fn model_for(&self, kind: GenerationKind) -> &str {
        match kind {
            GenerationKind::Image => &self.image_model,
            GenerationKind::Video => &self.video_model,
        }
    }
}

/// OpenAPI documentation for the health endpoint.
#[derive(OpenApi)]
#[openapi(paths(health))]
pub struct HealthOpenApi;

/// Creates and configures the main router for the application.
///
/// Generation routes answer unsupported methods with a JSON `405` and reject
/// bodies over `max_body_bytes` with a JSON `413`. Unknown paths get a JSON
/// `404`, handler panics become a JSON `500`, and every route sits behind a
/// permissive CORS layer so browsers can call the service from any origin.
pub fn create_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let body_limit = app_state.max_body_bytes;

    Router::new()
        .route(
            GENERATE_PATH,
            post(generate_handler)
                .options(preflight)
                .fallback(method_not_allowed),
        )
        .route(
            CALLBACK_PATH,
            post(callback_handler)
                .options(preflight)
                .fallback(method_not_allowed),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(app_state)
        .route(HEALTH_PATH, get(health))
        .merge(openapi_routes())
        .fallback(not_found)
        .layer(
            ServiceBuilder::new()
                .layer(cors)
                .layer(CatchPanicLayer::custom(handle_panic))
                .into_inner(),
        )
}

/// Starts and runs the HTTP server with graceful shutdown handling.
///
/// The server stops accepting connections on Ctrl+C and drains in-flight
/// requests before returning.
///
/// # Errors
///
/// Returns an error if the server fails while running.
pub async fn run_server(app_state: AppState, tcp_listener: TcpListener) -> anyhow::Result<()> {
    let app = create_router(app_state);
    let shutdown_signal = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(
                target = "mediagen-service",
                event = "shutdown_signal_error",
                error = %e,
                "Failed to listen for Ctrl+C"
            );
        }
        info!("Shutting down server...");
    };
    axum::serve(tcp_listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;
    Ok(())
}

/// Handles the health check endpoint.
///
/// Used by load balancers and monitoring to check that the server is up.
#[utoipa::path(
    get,
    path = "",
    tag = "health",
    responses(
        (status = OK, description = "Service is healthy", body = serde_json::Value)
    )
)]
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}
