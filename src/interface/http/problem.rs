use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::SubmissionError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Pre-acknowledgment failure rendered as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<SubmissionError> for ApiError {
    fn from(error: SubmissionError) -> Self {
        match error {
            SubmissionError::Validation(message) => Self {
                status: StatusCode::BAD_REQUEST,
                message,
            },
            SubmissionError::LocalPersistence(_) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: "Internal Server Error: Failed to save data.".to_string(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}
