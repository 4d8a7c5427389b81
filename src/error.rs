//! 统一的 API 错误类型与转换。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::error;

use crate::config::CONCURRENCY_RETRY_AFTER_SECS;
use crate::throttle::Denial;
use crate::uploads::UploadError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
    TooManyRequests(u64),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
            ApiError::TooManyRequests(retry_after) => {
                let mut headers = HeaderMap::new();
                if retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
                (StatusCode::TOO_MANY_REQUESTS, headers, "too many requests").into_response()
            }
        }
    }
}

impl From<Denial> for ApiError {
    fn from(denial: Denial) -> Self {
        match denial {
            Denial::RateLimitExceeded { retry_after } => {
                let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
                ApiError::TooManyRequests(secs.max(1))
            }
            Denial::ConcurrencyLimitExceeded => {
                ApiError::TooManyRequests(CONCURRENCY_RETRY_AFTER_SECS)
            }
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::InvalidFilename(rejection) => ApiError::BadRequest(rejection.to_string()),
            UploadError::PathTraversal => ApiError::BadRequest("invalid path".into()),
            UploadError::NotFound => ApiError::NotFound("file not found".into()),
            UploadError::Throttled(denial) => denial.into(),
            UploadError::Io(err) => {
                error!(error = %err, "file operation failed");
                ApiError::Internal("file operation failed".into())
            }
        }
    }
}
