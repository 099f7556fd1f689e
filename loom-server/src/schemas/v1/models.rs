//! OpenAI-compatible model-listing types.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// One entry of `GET /v1/models`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OpenAiModel {
    /// Model identifier usable in completion requests.
    pub id: String,
    /// Always `"model"`.
    pub object: String,
    /// Unix timestamp the entry was produced at.
    pub created: i64,
    pub owned_by: String,
}

/// Response body for `GET /v1/models`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OpenAiModelsResponse {
    /// Always `"list"`.
    pub object: String,
    pub data: Vec<OpenAiModel>,
}
