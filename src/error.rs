use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("User session not found.")]
    SessionNotFound,
    #[error("Question not found.")]
    QuestionNotFound,
    #[error("Kernel failed to start in time.")]
    KernelStartTimeout,
    #[error("kernel failed to start: {0}")]
    KernelStart(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("failed to persist submission: {0}")]
    Persistence(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::SessionNotFound | Self::QuestionNotFound => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::KernelStartTimeout
            | Self::KernelStart(_)
            | Self::Persistence(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorBody {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}
