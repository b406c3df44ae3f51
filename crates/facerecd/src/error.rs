use crate::engine::EngineError;
use crate::store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Request body too large")]
    TooLarge,

    /// The image was understood but unusable (no face, too dark, too small).
    #[error("{0}")]
    Unprocessable(String),

    #[error("Recognition engine unavailable: {0}")]
    Unavailable(String),

    #[error("Storage error")]
    Store(#[source] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn log_error(error: &ApiError) {
    match error {
        ApiError::BadRequest(msg) => warn!("Bad request: {}", msg),
        ApiError::NotFound(msg) => warn!("Not found: {}", msg),
        ApiError::Conflict(msg) => warn!("Conflict: {}", msg),
        ApiError::TooLarge => warn!("Request body too large"),
        ApiError::Unprocessable(msg) => warn!("Rejected image: {}", msg),
        ApiError::Unavailable(msg) => error!("Engine unavailable: {}", msg),
        ApiError::Store(e) => error!("Storage failure: {}", e),
        ApiError::Internal(msg) => error!("Internal error: {}", msg),
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Store(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        log_error(&self);
        error_response(self.status(), &self.to_string())
    }
}

/// The `{"success": false, "error": ...}` envelope shared by every failure.
pub fn error_response(status: StatusCode, message: &str) -> Response {
    let body = Json(json!({ "success": false, "error": message }));
    (status, body).into_response()
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(format!("{} not found", capitalize(&what))),
            StoreError::Conflict(msg) => Self::Conflict(msg),
            other => Self::Store(other),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NoFaceDetected | EngineError::FaceTooSmall { .. } | EngineError::TooDark => {
                Self::Unprocessable(err.to_string())
            }
            EngineError::ChannelClosed | EngineError::Spawn(_) => Self::Unavailable(err.to_string()),
            EngineError::Pipeline(e) => Self::Internal(format!("inference failed: {e}")),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ApiError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Unavailable("request timed out".into())
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
