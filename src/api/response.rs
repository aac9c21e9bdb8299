//! Response envelopes
//!
//! Success: `{"status": "success", "data": ...}`.
//! Failure: `{"status": "error", "message": "Error: ..."}`, plus an `errors`
//! map for validation failures.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use crate::error::Error;

/// Successful API answer
pub struct Success<T>(pub T);

impl<T: Serialize> IntoResponse for Success<T> {
    fn into_response(self) -> Response {
        Json(json!({
            "status": "success",
            "data": self.0,
        }))
        .into_response()
    }
}

/// Failed API answer
#[derive(Debug)]
pub struct ApiError(pub Error);

pub type ApiResult<T> = std::result::Result<Success<T>, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            Error::NoPrimary
            | Error::NotPrimary(_)
            | Error::ConnectionFailed { .. }
            | Error::ConnectionTimeout(_)
            | Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Error::Timeout => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        } else {
            tracing::debug!("Request rejected ({}): {}", status, self.0);
        }

        let mut body = json!({
            "status": "error",
            "message": format!("Error: {}", self.0),
        });
        if let Error::Validation { field, message } = &self.0 {
            let mut errors = serde_json::Map::new();
            errors.insert(field.clone(), json!([message]));
            body["errors"] = serde_json::Value::Object(errors);
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (Error::validation("timestamp", "is required"), 422),
            (Error::BadRequest("x".into()), 400),
            (Error::Unauthorized("x".into()), 401),
            (Error::Forbidden("x".into()), 403),
            (Error::UnsupportedMediaType("application/json"), 415),
            (Error::BackupNotFound, 404),
            (Error::RestorePointNotFound, 404),
            (Error::BranchNotFound("app/main".into()), 404),
            (Error::NoPrimary, 503),
            (Error::Timeout, 408),
            (Error::Internal("x".into()), 500),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError(error).status().as_u16(), status);
        }
    }

    #[tokio::test]
    async fn test_error_body() {
        let response = ApiError(Error::BackupNotFound).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "error");
        assert_eq!(body["message"], "Error: backup not found");
    }

    #[tokio::test]
    async fn test_validation_body() {
        let response = ApiError(Error::validation("timestamp", "must be an integer")).into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["errors"]["timestamp"][0], "must be an integer");
    }
}
