//! API error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::error::JobError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Job(#[from] JobError),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Job(e) => match e {
                JobError::Validation(_) => StatusCode::BAD_REQUEST,
                JobError::NotFound(_) => StatusCode::NOT_FOUND,
                JobError::InvalidState { .. } => StatusCode::CONFLICT,
                JobError::QueueFull { .. } | JobError::ShuttingDown => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                JobError::TranscodeExecution { .. }
                | JobError::Persistence(_)
                | JobError::Cancelled
                | JobError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            error!("Request failed: {self}");
        }

        let body = ErrorResponse {
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobStatus;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ApiError::bad_request("bad"), StatusCode::BAD_REQUEST),
            (JobError::validation("x").into(), StatusCode::BAD_REQUEST),
            (JobError::not_found("j").into(), StatusCode::NOT_FOUND),
            (
                JobError::invalid_state("j", JobStatus::Completed, "pause").into(),
                StatusCode::CONFLICT,
            ),
            (
                JobError::QueueFull { capacity: 1 }.into(),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                JobError::persistence("disk").into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.status_code(), expected, "{err}");
        }
    }

    #[tokio::test]
    async fn test_detail_body() {
        let response = ApiError::from(JobError::not_found("abc")).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["detail"].as_str().unwrap().contains("abc"));
    }
}
