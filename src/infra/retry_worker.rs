use std::sync::Arc;
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

use crate::application::use_cases::retry::RetryUseCases;

/// Polls the retry queue for due items. One loop per process; concurrent instances are
/// kept apart by the claim lease on each row.
pub async fn run_retry_loop(retry_uc: Arc<RetryUseCases>, poll_interval: Duration) {
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "Retry worker started (polling every {}s)",
        poll_interval.as_secs()
    );

    loop {
        ticker.tick().await;
        run_sweep(&retry_uc).await;
    }
}

async fn run_sweep(retry_uc: &RetryUseCases) {
    let now = chrono::Utc::now().naive_utc();
    // The use case logs the per-sweep summary.
    if let Err(e) = retry_uc.sweep(now).await {
        error!(error = %e, "Retry sweep failed");
    }
}
