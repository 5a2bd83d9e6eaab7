use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::identity::GatewayError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation failed: {}", summarize(.0))]
    Validation(Vec<FieldError>),
    #[error("unknown action type: {0}")]
    UnknownActionType(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("token not found")]
    TokenNotFound,
    #[error("token expired")]
    TokenExpired,
    #[error("token already used")]
    TokenAlreadyUsed,
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("identity provider unavailable: {0}")]
    Transient(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::Internal(err.to_string())
    }

    pub fn bad_request<E: std::fmt::Display>(err: E) -> Self {
        Self::BadRequest(err.to_string())
    }

    pub fn field(field: &str, message: &str) -> Self {
        Self::Validation(vec![FieldError::new(field, message)])
    }
}

fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Serialize)]
struct ProblemResponse<'a> {
    code: &'a str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<Vec<FieldError>>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let (status, code, errors) = match self {
            AppError::Validation(errors) => {
                (StatusCode::BAD_REQUEST, "validation_error", Some(errors))
            }
            AppError::UnknownActionType(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "unknown_action_type", None)
            }
            AppError::InvalidState(_) => (StatusCode::CONFLICT, "invalid_state", None),
            AppError::TokenNotFound => (StatusCode::NOT_FOUND, "token_not_found", None),
            AppError::TokenExpired => (StatusCode::GONE, "token_expired", None),
            AppError::TokenAlreadyUsed => (StatusCode::CONFLICT, "token_already_used", None),
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized", None),
            AppError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden", None),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", None),
            AppError::Conflict(_) => (StatusCode::CONFLICT, "conflict", None),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request", None),
            AppError::Transient(_) => (StatusCode::SERVICE_UNAVAILABLE, "transient", None),
            AppError::NotImplemented(_) => (StatusCode::NOT_IMPLEMENTED, "not_implemented", None),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", None),
        };

        (
            status,
            Json(ProblemResponse {
                code,
                message,
                errors,
            }),
        )
            .into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(value: sqlx::Error) -> Self {
        AppError::internal(value)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        AppError::internal(value)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        AppError::internal(value)
    }
}

// The caller only learns that the resource is absent, never which lookup failed.
impl From<GatewayError> for AppError {
    fn from(value: GatewayError) -> Self {
        match value {
            GatewayError::NotFound(_) => AppError::NotFound("no such resource".to_string()),
            GatewayError::Unauthorized(msg) => AppError::Forbidden(msg),
            GatewayError::Transient(msg) => AppError::Transient(msg),
        }
    }
}
