//! 统一的请求错误类型与转换。

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::storage::StorageError;

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Unauthorized(HeaderMap),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Unauthorized(headers) => {
                (StatusCode::UNAUTHORIZED, headers, "unauthorized").into_response()
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
        }
    }
}

/// 沙箱越界与 I/O 错误一律表现为 404，不泄露细节。
impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::OutsideRoot => debug!("path escapes storage root"),
            StorageError::Io(err) => debug!(error = %err, "storage io error"),
        }
        ApiError::NotFound("File not found".into())
    }
}
