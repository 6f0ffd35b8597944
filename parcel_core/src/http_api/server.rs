//! HTTP server for the relay
//!
//! Builds the axum router and runs it until cancelled.

use super::handlers::{
    active_handler, complete_handler, download_handler, health_handler, poll_handler,
    receivers_handler, register_handler, upload_handler,
};
use crate::delivery::Broker;
use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{DefaultBodyLimit, Request},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Room for multipart boundaries and the instruction fields around the file
const MULTIPART_OVERHEAD_BYTES: u64 = 64 * 1024;

/// Middleware to add security headers
async fn add_security_headers(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("no-referrer"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    response
}

/// Build the relay router around a shared broker
pub fn create_router(broker: Arc<Broker>, request_timeout: Duration) -> Router {
    let body_limit = broker
        .options()
        .max_upload_bytes
        .saturating_add(MULTIPART_OVERHEAD_BYTES);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);

    Router::new()
        .route("/health", get(health_handler))
        .route("/register", post(register_handler))
        .route("/receivers", get(receivers_handler))
        .route("/active", get(active_handler))
        .route("/upload", post(upload_handler))
        .route("/poll/{id}", get(poll_handler))
        .route("/download/{key}", get(download_handler))
        .route("/complete/{id}", post(complete_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(middleware::from_fn(add_security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(broker)
}

/// Serve the relay on `addr` until `cancel_token` fires
pub async fn start_http_server(
    addr: SocketAddr,
    broker: Arc<Broker>,
    request_timeout: Duration,
    cancel_token: Option<CancellationToken>,
) -> Result<()> {
    let router = create_router(broker, request_timeout);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!("Relay listening on http://{}", listener.local_addr()?);

    if let Some(ct) = cancel_token {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                ct.cancelled().await;
                tracing::info!("HTTP server shutting down gracefully");
            })
            .await?;
    } else {
        axum::serve(listener, router).await?;
    }

    Ok(())
}
