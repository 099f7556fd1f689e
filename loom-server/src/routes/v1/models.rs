//! OpenAI-compatible model listing.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use utoipa::OpenApi;

use crate::schemas::v1::models::{OpenAiModel, OpenAiModelsResponse};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(list_models), components(schemas(OpenAiModel, OpenAiModelsResponse)))]
pub struct ModelsApi;

/// Register model-listing routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/models", get(list_models))
}

/// List the models this server can complete with (`GET /v1/models`).
///
/// The server hosts a single loaded model, so the list has one entry with
/// the configured id.
#[utoipa::path(
    get,
    path = "/v1/models",
    tag = "models",
    responses(
        (status = 200, description = "Available models", body = OpenAiModelsResponse)
    )
)]
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<OpenAiModelsResponse> {
    Json(OpenAiModelsResponse {
        object: "list".to_owned(),
        data: vec![OpenAiModel {
            id: state.config.model_id.clone(),
            object: "model".to_owned(),
            created: Utc::now().timestamp(),
            owned_by: "loom".to_owned(),
        }],
    })
}
