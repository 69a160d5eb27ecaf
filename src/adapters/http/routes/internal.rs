use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    adapters::http::app_state::AppState,
    app_error::AppResult,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/subscriptions", post(open_checkout))
        .route("/subscriptions/{user_id}/cancel", post(cancel_subscription))
        .route("/payment-failures/{subscription_id}", get(list_payment_failures))
        .route("/dunning-attempts/{user_id}", get(list_dunning_attempts))
        .route("/entitlements/{user_id}", get(get_entitlement))
        .route("/events/{event_id}", get(get_event_status))
        .route("/dead-letters", get(list_dead_letters))
        .route("/dead-letters/{id}/annotate", post(annotate_dead_letter))
        .route("/dead-letters/{id}/replay", post(replay_dead_letter))
        .route("/retry-queue/stats", get(retry_queue_stats))
        .route("/audit/{entity_id}", get(list_audit))
}

fn now() -> chrono::NaiveDateTime {
    chrono::Utc::now().naive_utc()
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

// ============================================================================
// Subscriptions
// ============================================================================

#[derive(Deserialize)]
struct OpenCheckoutPayload {
    user_id: Uuid,
    provider_customer_id: String,
}

/// POST /internal/subscriptions
async fn open_checkout(
    State(app_state): State<AppState>,
    Json(payload): Json<OpenCheckoutPayload>,
) -> AppResult<impl IntoResponse> {
    let subscription = app_state
        .subscription_use_cases
        .open_checkout(payload.user_id, &payload.provider_customer_id, now())
        .await?;

    Ok((StatusCode::CREATED, Json(subscription)))
}

/// POST /internal/subscriptions/{user_id}/cancel
async fn cancel_subscription(
    State(app_state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let subscription = app_state
        .subscription_use_cases
        .cancel_immediately(user_id, now())
        .await?;

    Ok(Json(subscription))
}

/// GET /internal/payment-failures/{subscription_id}
async fn list_payment_failures(
    State(app_state): State<AppState>,
    Path(subscription_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let failures = app_state
        .subscription_use_cases
        .list_payment_failures(subscription_id)
        .await?;

    Ok(Json(failures))
}

/// GET /internal/dunning-attempts/{user_id}?limit=
async fn list_dunning_attempts(
    State(app_state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<LimitQuery>,
) -> AppResult<impl IntoResponse> {
    let attempts = app_state
        .subscription_use_cases
        .list_dunning_attempts(user_id, query.limit)
        .await?;

    Ok(Json(attempts))
}

/// GET /internal/entitlements/{user_id}
async fn get_entitlement(
    State(app_state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let entitlement = app_state
        .subscription_use_cases
        .entitlement(user_id, now())
        .await?;

    Ok(Json(entitlement))
}

// ============================================================================
// Dead letters and retry queue
// ============================================================================

/// GET /internal/dead-letters?limit=
async fn list_dead_letters(
    State(app_state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> AppResult<impl IntoResponse> {
    let items = app_state
        .retry_use_cases
        .list_dead_letters(query.limit)
        .await?;

    Ok(Json(items))
}

#[derive(Deserialize)]
struct AnnotatePayload {
    note: String,
    operator: String,
}

/// POST /internal/dead-letters/{id}/annotate
async fn annotate_dead_letter(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AnnotatePayload>,
) -> AppResult<impl IntoResponse> {
    let item = app_state
        .retry_use_cases
        .annotate_dead_letter(id, &payload.note, &payload.operator, now())
        .await?;

    Ok(Json(item))
}

#[derive(Deserialize)]
struct ReplayPayload {
    #[serde(default)]
    reset_ledger: bool,
}

/// POST /internal/dead-letters/{id}/replay
async fn replay_dead_letter(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Option<Json<ReplayPayload>>,
) -> AppResult<impl IntoResponse> {
    let reset_ledger = payload.is_some_and(|Json(p)| p.reset_ledger);

    let result = app_state
        .retry_use_cases
        .replay_dead_letter(id, reset_ledger, now())
        .await?;

    Ok(Json(result))
}

/// GET /internal/events/{event_id}
async fn get_event_status(
    State(app_state): State<AppState>,
    Path(event_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let status = app_state.retry_use_cases.event_status(&event_id).await?;
    Ok(Json(status))
}

/// GET /internal/retry-queue/stats
async fn retry_queue_stats(State(app_state): State<AppState>) -> AppResult<impl IntoResponse> {
    let stats = app_state.retry_use_cases.stats(now()).await?;
    Ok(Json(stats))
}

// ============================================================================
// Audit
// ============================================================================

/// GET /internal/audit/{entity_id}?limit=
async fn list_audit(
    State(app_state): State<AppState>,
    Path(entity_id): Path<Uuid>,
    Query(query): Query<LimitQuery>,
) -> AppResult<impl IntoResponse> {
    let entries = app_state
        .subscription_use_cases
        .list_audit(entity_id, query.limit)
        .await?;

    Ok(Json(entries))
}
