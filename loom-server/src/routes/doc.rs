//! OpenAPI document assembly.

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(info(
    title = "loom-server",
    description = "OpenAI-compatible chat completions over a local language model"
))]
struct RootApi;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    let mut spec = RootApi::openapi();
    spec.merge(crate::routes::health::HealthApi::openapi());
    spec.merge(crate::routes::v1::api_docs());
    spec
}
