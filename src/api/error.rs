use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::services::deadline::DeadlineExceeded;
use crate::services::rpc::RpcError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Duplicate Upload: {0}")]
    DuplicateUpload(String),

    #[error("Unprocessable Entity: {0}")]
    Unprocessable(String),

    #[error("Payload Too Large: {0}")]
    PayloadTooLarge(String),

    #[error("Request Timeout: upload exceeded {timeout_ms}ms")]
    RequestTimeout { timeout_ms: u64 },

    #[error("Upstream Timeout: {0}")]
    UpstreamTimeout(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),

    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

impl From<DeadlineExceeded> for AppError {
    fn from(e: DeadlineExceeded) -> Self {
        AppError::RequestTimeout {
            timeout_ms: e.timeout_ms,
        }
    }
}

impl From<RpcError> for AppError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::BadRequest(msg) => AppError::BadRequest(msg),
            RpcError::Forbidden(msg) => AppError::Forbidden(msg),
            RpcError::Unprocessable(msg) => AppError::Unprocessable(msg),
            timeout @ RpcError::Timeout { .. } => AppError::UpstreamTimeout(timeout.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::DuplicateUpload(_) => StatusCode::CONFLICT,
            AppError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::RequestTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
            AppError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Internal(_) | AppError::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Headers that tell clients and intermediaries not to replay the request.
pub fn discourage_retry(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                "Internal Server Error".to_string()
            }
            AppError::Anyhow(e) => {
                tracing::error!("Anyhow error: {:?}", e);
                "Internal Server Error".to_string()
            }
            AppError::UpstreamTimeout(msg) => {
                tracing::warn!("Upstream timeout: {}", msg);
                msg.clone()
            }
            AppError::BadRequest(msg)
            | AppError::Forbidden(msg)
            | AppError::DuplicateUpload(msg)
            | AppError::Unprocessable(msg)
            | AppError::PayloadTooLarge(msg) => msg.clone(),
            AppError::RequestTimeout { .. } => self.to_string(),
        };

        let body = Json(json!({
            "error": message
        }));

        let mut response = (status, body).into_response();
        if matches!(self, AppError::RequestTimeout { .. }) {
            discourage_retry(&mut response);
        }
        response
    }
}
