pub mod internal;
pub mod webhooks;

use axum::{Router, middleware, routing::get};

use crate::adapters::http::{app_state::AppState, middleware::require_admin_token};

pub fn router(app_state: AppState) -> Router {
    let internal = internal::router().route_layer(middleware::from_fn_with_state(
        app_state.clone(),
        require_admin_token,
    ));

    Router::new()
        .route("/health", get(health))
        .nest("/webhooks", webhooks::router())
        .nest("/internal", internal)
        .with_state(app_state)
}

async fn health() -> &'static str {
    "ok"
}
