//! Maps broker errors to HTTP responses.

use crate::error::BrokerError;
use axum::Json;
use axum::extract::multipart::MultipartError;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("invalid multipart body: {0}")]
    Multipart(#[from] MultipartError),

    #[error("invalid JSON body: {0}")]
    Json(#[from] JsonRejection),
}

impl ApiError {
    /// Recover the multipart error a file field was wrapped in while staging
    pub fn from_staging(err: BrokerError) -> Self {
        match err {
            BrokerError::Storage(io) => match io.downcast::<MultipartError>() {
                Ok(multipart) => ApiError::Multipart(multipart),
                Err(io) => ApiError::Broker(BrokerError::Storage(io)),
            },
            other => ApiError::Broker(other),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Broker(e) => match e {
                BrokerError::MissingPayload | BrokerError::InvalidIdentity(_) => {
                    StatusCode::BAD_REQUEST
                }
                BrokerError::UnknownReceiver(_) | BrokerError::PayloadNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                BrokerError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                BrokerError::Storage(_) | BrokerError::Corrupt(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::Multipart(e) => e.status(),
            ApiError::Json(e) => e.status(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::warn!("Request rejected: {}", self);
        }

        let body = serde_json::json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}
