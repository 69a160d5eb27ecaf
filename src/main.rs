use std::time::Duration;

use dotenvy::dotenv;
use tracing::info;

use billing_reconciler::infra::{
    app::create_app, config::AppConfig, dunning_worker::run_dunning_loop, error::InfraError,
    retry_worker::run_retry_loop, setup::{init_app_state, init_tracing},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let config = AppConfig::from_env()?;
    init_tracing(config.log_file.as_deref())?;

    let app_state = init_app_state(&config).await?;

    // Background workers (after tracing is initialized)
    let retry_use_cases = app_state.retry_use_cases.clone();
    let retry_poll = Duration::from_secs(config.billing.retry_poll_interval_secs);
    tokio::spawn(async move {
        run_retry_loop(retry_use_cases, retry_poll).await;
    });

    let dunning_use_cases = app_state.dunning_use_cases.clone();
    let expiry_every = Duration::from_secs(config.billing.grace_expiry_interval_secs);
    let warning_every = Duration::from_secs(config.billing.grace_warning_interval_secs);
    tokio::spawn(async move {
        run_dunning_loop(dunning_use_cases, expiry_every, warning_every).await;
    });

    let app = create_app(app_state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .map_err(InfraError::TcpBind)?;

    info!("Billing reconciler listening at {}", &listener.local_addr()?);

    axum::serve(listener, app)
        .await
        .map_err(InfraError::Server)?;

    Ok(())
}
