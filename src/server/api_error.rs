use super::connection_pool::PoolError;
use crate::ipmi::IpmiError;
use axum::extract::rejection::JsonRejection;
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::warn;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Ipmi(#[from] IpmiError),

    #[error("Invalid request body: {0}")]
    Body(#[from] JsonRejection),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Pool(PoolError::UnknownTarget(_)) => (StatusCode::NOT_FOUND, "UNKNOWN_TARGET"),
            ApiError::Pool(PoolError::Factory { .. }) => (StatusCode::BAD_GATEWAY, "CONNECT_FAILED"),
            ApiError::Pool(PoolError::Exhausted(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "POOL_EXHAUSTED")
            }
            ApiError::Pool(PoolError::Closed(_)) => (StatusCode::SERVICE_UNAVAILABLE, "POOL_CLOSED"),
            ApiError::Pool(PoolError::Cancelled(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "CANCELLED")
            }
            ApiError::Ipmi(IpmiError::InvalidPolicy(_)) => (StatusCode::BAD_REQUEST, "INVALID_POLICY"),
            ApiError::Ipmi(_) => (StatusCode::BAD_GATEWAY, "IPMI_ERROR"),
            ApiError::Body(_) => (StatusCode::BAD_REQUEST, "INVALID_BODY"),
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Pool(e) if e.is_retryable())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        if status.is_server_error() {
            warn!("Request failed: {}", self);
        }
        let body = ErrorResponse {
            error: self.to_string(),
            code,
        };
        let retryable = self.is_retryable();
        let mut response = (status, Json(body)).into_response();
        if retryable {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}
