use axum::extract::rejection::{BytesRejection, FailedToBufferBody, JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::error;
use utoipa::ToSchema;

use crate::rate_limit::RateLimitError;
use crate::store::StoreError;

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    RateLimit(#[from] RateLimitError),
    #[error("not found")]
    NotFound,
    #[error("request validation failed: {0}")]
    Validation(#[from] garde::Report),
    #[error("invalid query string: {0}")]
    Query(#[from] QueryRejection),
    #[error("invalid request body: {0}")]
    Json(#[from] JsonRejection),
    #[error("request body exceeds the configured limit")]
    PayloadTooLarge,
    #[error("message is currently processing and cannot be deleted")]
    MessageProcessing,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorResponse {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        error!("api error: {self}");

        let status = match &self {
            ApiError::Store(StoreError::NotFound) | ApiError::Store(StoreError::PoolNotFound) | ApiError::NotFound => {
                StatusCode::NOT_FOUND
            }
            ApiError::Store(StoreError::MessageProcessing(_)) | ApiError::MessageProcessing => StatusCode::CONFLICT,
            ApiError::Validation(_) | ApiError::Query(_) | ApiError::Json(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Store(_) | ApiError::RateLimit(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(ApiErrorResponse { error: self.to_string() })).into_response()
    }
}

impl From<BytesRejection> for ApiError {
    fn from(rejection: BytesRejection) -> Self {
        if matches!(rejection, BytesRejection::FailedToBufferBody(FailedToBufferBody::LengthLimitError(_))) {
            ApiError::PayloadTooLarge
        } else {
            ApiError::Json(JsonRejection::BytesRejection(rejection))
        }
    }
}
