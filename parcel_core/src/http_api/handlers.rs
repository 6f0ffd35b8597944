//! Route handlers

use super::error::ApiError;
use crate::delivery::{Broker, DeliveryRequest, DeliverySlot, ReceiverSummary};
use crate::error::BrokerError;
use axum::Json;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Header carrying the BLAKE3 hash of a downloaded payload
pub const PAYLOAD_HASH_HEADER: HeaderName = HeaderName::from_static("x-payload-hash");

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    pub id: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub message: String,
    pub current_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub message: String,
    pub file_name: String,
    pub receiver_id: String,
    pub payload_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PollResponse {
    pub message: String,
    pub file_info: DeliverySlot,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActiveResponse {
    pub active_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub message: String,
    pub completed: bool,
}

pub async fn health_handler() -> &'static str {
    "ok"
}

/// Register a receiver or update its display name
pub async fn register_handler(
    State(broker): State<Arc<Broker>>,
    body: Result<Json<RegisterBody>, JsonRejection>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let Json(body) = body?;
    let id = body
        .id
        .ok_or_else(|| BrokerError::InvalidIdentity("missing 'id'".to_string()))?;
    let current_name = broker.register(&id, body.name.as_deref()).await?;

    Ok(Json(RegisterResponse {
        message: "Receiver registered".to_string(),
        current_name,
    }))
}

pub async fn receivers_handler(State(broker): State<Arc<Broker>>) -> Json<Vec<ReceiverSummary>> {
    Json(broker.list().await)
}

pub async fn active_handler(State(broker): State<Arc<Broker>>) -> Json<ActiveResponse> {
    Json(ActiveResponse {
        active_ids: broker.active().await,
    })
}

/// Accept a file plus delivery instructions from a sender.
///
/// The file part is staged as it streams in, so the instruction fields may
/// come before or after it.
pub async fn upload_handler(
    State(broker): State<Arc<Broker>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut request = DeliveryRequest::default();
    let mut staged = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                request.file_name = field.file_name().unwrap_or_default().to_string();
                let chunks = Box::pin(field.map_err(std::io::Error::other));
                staged = Some(broker.stage(chunks).await.map_err(ApiError::from_staging)?);
            }
            "receiver_id" | "pc_id" => request.receiver_id = field.text().await?,
            "target_path" | "save_path" => request.target_path = field.text().await?,
            "execute" | "auto_execute" => request.execute = field.text().await?.trim() == "true",
            _ => tracing::debug!("Ignoring upload field {:?}", name),
        }
    }

    let receipt = broker.intake(request, staged).await?;
    Ok(Json(UploadResponse {
        message: format!(
            "File '{}' received, receiver {} notified",
            receipt.file_name, receipt.receiver_id
        ),
        file_name: receipt.file_name,
        receiver_id: receipt.receiver_id,
        payload_key: receipt.payload_key,
    }))
}

/// Receiver asks whether a delivery is waiting; 204 when there is none
pub async fn poll_handler(
    State(broker): State<Arc<Broker>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    match broker.poll(&id).await? {
        Some(slot) => Ok(Json(PollResponse {
            message: "File pending".to_string(),
            file_info: slot,
        })
        .into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// `Content-Disposition` value safe to put in a header
fn attachment_disposition(file_name: &str) -> HeaderValue {
    let ascii: String = file_name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    HeaderValue::from_str(&format!("attachment; filename=\"{}\"", ascii))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

/// Stream a payload to the receiver
pub async fn download_handler(
    State(broker): State<Arc<Broker>>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    let fetched = broker.fetch(&key).await?;
    let size = fetched.stream.size();

    let mut response = Response::new(Body::from_stream(fetched.stream));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        attachment_disposition(&fetched.file_name),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    if let Some(hash) = fetched
        .payload_hash
        .as_deref()
        .and_then(|h| HeaderValue::from_str(h).ok())
    {
        headers.insert(PAYLOAD_HASH_HEADER, hash);
    }

    Ok(response)
}

/// Receiver acknowledges that it has applied its delivery
pub async fn complete_handler(
    State(broker): State<Arc<Broker>>,
    Path(id): Path<String>,
) -> Result<Json<CompleteResponse>, ApiError> {
    let completed = broker.complete(&id).await?;
    let message = if completed {
        format!("Delivery for {} marked as completed", id)
    } else {
        format!("No pending delivery for {}", id)
    };
    Ok(Json(CompleteResponse { message, completed }))
}
