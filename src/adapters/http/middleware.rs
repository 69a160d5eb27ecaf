use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use secrecy::ExposeSecret;

use crate::{
    adapters::http::app_state::AppState, app_error::AppError,
    infra::signature::constant_time_compare,
};

/// Guards the operator API with `Authorization: Bearer <ADMIN_API_TOKEN>`.
pub async fn require_admin_token(
    State(app_state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or(AppError::Unauthorized)?;

    let expected = app_state.admin_api_token.expose_secret();
    if expected.is_empty() || !constant_time_compare(presented, expected) {
        tracing::warn!(path = %request.uri().path(), "Rejected operator request with bad token");
        return Err(AppError::Unauthorized);
    }

    Ok(next.run(request).await)
}
