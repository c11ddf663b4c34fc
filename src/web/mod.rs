pub mod admin;
pub mod stream;

use crate::error::StreamError;
use axum::http::StatusCode;

/// 将推流错误映射为 HTTP 状态码
pub fn stream_error(e: StreamError) -> (StatusCode, String) {
    let status = match e {
        StreamError::NoChannels => StatusCode::BAD_REQUEST,
        StreamError::InsufficientMemory { .. } => StatusCode::SERVICE_UNAVAILABLE,
        StreamError::Launch { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}
