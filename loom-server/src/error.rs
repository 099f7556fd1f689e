//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors are automatically converted
//! to a JSON-body HTTP response with an appropriate status code.
//!
//! Client-facing variants carry short single-line messages naming the
//! offending field or condition.  Engine failures are logged with full
//! detail but surface only a stable summary, so backend internals never
//! leak to callers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use loom_engine::EngineError;

/// All errors that can occur in the loom-server request lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The caller asked for something the server does not implement.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Propagated from the inference engine.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// An unclassified internal server error with a client-safe message.
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, client_message) = match &self {
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ServerError::NotImplemented(m) => (StatusCode::NOT_IMPLEMENTED, m.clone()),
            ServerError::Engine(e) => {
                error!(error = %e, "inference engine error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "inference engine error".to_owned(),
                )
            }
            ServerError::Internal(m) => {
                error!(message = %m, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, m.clone())
            }
        };
        (status, Json(json!({ "error": client_message }))).into_response()
    }
}
