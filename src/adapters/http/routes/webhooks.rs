use axum::{
    Json, Router,
    body::{Body, to_bytes},
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
};
use serde::Serialize;
use tracing::warn;

use crate::{
    adapters::http::app_state::AppState,
    app_error::{AppError, AppResult},
    application::use_cases::reconcile::IngestOutcome,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/{provider}", post(receive_webhook))
}

#[derive(Serialize)]
struct WebhookAck {
    status: IngestOutcome,
}

/// Best-effort event type for rejection logs. The payload itself is never logged.
fn peek_event_type(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("type")?.as_str().map(str::to_string)
}

/// POST /webhooks/{provider}
///
/// Answers 400 for anything that fails authentication or parsing and 200 once the event
/// has been accepted, deduplicated, queued for retry or dead-lettered.
async fn receive_webhook(
    State(app_state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> AppResult<impl IntoResponse> {
    if provider != app_state.config.provider {
        return Err(AppError::NotFound);
    }

    let bytes = to_bytes(body, app_state.config.max_webhook_payload_bytes)
        .await
        .map_err(|_| AppError::PayloadTooLarge)?;

    let signature = headers
        .get(app_state.config.signature_header.as_str())
        .and_then(|v| v.to_str().ok());

    let now = chrono::Utc::now();
    if let Err(reason) = app_state
        .signature_verifier
        .verify(&bytes, signature, now.timestamp())
    {
        warn!(
            reason = %reason,
            event_type = ?peek_event_type(&bytes),
            "Webhook signature rejected"
        );
        return Err(AppError::InvalidSignature(reason.to_string()));
    }

    let raw = std::str::from_utf8(&bytes)
        .map_err(|_| AppError::InvalidInput("Webhook body is not valid UTF-8".into()))?;

    let outcome = app_state
        .reconcile_use_cases
        .ingest(raw, now.naive_utc())
        .await?;

    Ok((StatusCode::OK, Json(WebhookAck { status: outcome })))
}
