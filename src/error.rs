//! HTTP-facing error surface. Components return typed errors; everything
//! funnels into `ApiError`, which renders as `{"error": "<message>"}` with
//! the mapped status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    TooLarge(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => ApiError::NotFound("not found".to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<crate::gate::GateError> for ApiError {
    fn from(err: crate::gate::GateError) -> Self {
        use crate::gate::GateError;
        let msg = err.to_string();
        match err {
            GateError::NotAllowed
            | GateError::BasePath
            | GateError::SymlinkEscape
            | GateError::DifferentBase => ApiError::Forbidden(msg),
            GateError::NotFound => ApiError::NotFound(msg),
            GateError::Invalid(_) => ApiError::BadRequest(msg),
            GateError::Ownership(_) | GateError::Io(_) => ApiError::Internal(msg),
        }
    }
}

impl From<crate::owner::OwnerError> for ApiError {
    fn from(err: crate::owner::OwnerError) -> Self {
        use crate::owner::OwnerError;
        match &err {
            OwnerError::InvalidMode(_) | OwnerError::InvalidIds => {
                ApiError::BadRequest(err.to_string())
            }
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(err: sea_orm::DbErr) -> Self {
        ApiError::Internal(err.to_string())
    }
}
