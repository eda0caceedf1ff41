use axum::Router;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::handlers::callbacks::{CallbackOpenApi, CALLBACK_PATH};
use crate::handlers::generations::{GenerateOpenApi, GENERATE_PATH};
use crate::server::{HealthOpenApi, HEALTH_PATH};

/// Path of the Swagger UI
pub const SWAGGER_UI_PATH: &str = "/swagger-ui";

/// Path the OpenAPI document is served from
pub const OPENAPI_JSON_PATH: &str = "/api-docs/openapi.json";

#[derive(OpenApi)]
#[openapi(
    nest(
        (path = HEALTH_PATH, api = HealthOpenApi),
        (path = GENERATE_PATH, api = GenerateOpenApi),
        (path = CALLBACK_PATH, api = CallbackOpenApi),
    ),
    tags(
        (name = "health", description = "Health check"),
        (name = "generate", description = "Image and video generation"),
    ),
    servers(
        (url = "http://localhost:8080"),
    )
)]
pub struct ApiDoc;

pub fn openapi_routes() -> Router {
    Router::new().merge(SwaggerUi::new(SWAGGER_UI_PATH).url(OPENAPI_JSON_PATH, ApiDoc::openapi()))
}
