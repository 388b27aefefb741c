use std::time::Duration;

use axum::{
    Json,
    extract::{FromRequest, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use log::error;
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by request handlers.
///
/// Every variant renders as a `{ "message": ... }` JSON body so the frontend
/// can show the text directly in a toast.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("Already marked within last 24 hours")]
    AlreadyMarked { retry_after: Duration },

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        AppError::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        AppError::NotFound(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::AlreadyMarked { .. } => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Storage(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// `Json` extractor whose rejections render as [`AppError::BadRequest`]
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct AppJson<T>(pub T);

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        if let AppError::AlreadyMarked { retry_after } = &self {
            let retry_ms = retry_after.as_millis() as u64;
            let body = json!({
                "message": self.to_string(),
                "retryAfterMs": retry_ms,
            });
            let mut response = (status, Json(body)).into_response();
            // whole seconds, rounded up so clients never retry early
            let secs = retry_ms.div_ceil(1000);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            return response;
        }

        if matches!(self, AppError::Storage(_) | AppError::Internal(_)) {
            error!("{self}");
            return (status, Json(json!({ "message": "server error" }))).into_response();
        }

        (status, Json(json!({ "message": self.to_string() }))).into_response()
    }
}
