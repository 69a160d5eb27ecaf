use std::sync::Arc;
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

use crate::application::use_cases::dunning::DunningUseCases;

/// Runs the grace expiry sweep and the grace warning sweep on their own tickers.
pub async fn run_dunning_loop(
    dunning_uc: Arc<DunningUseCases>,
    expiry_interval: Duration,
    warning_interval: Duration,
) {
    let mut expiry_ticker = interval(expiry_interval);
    let mut warning_ticker = interval(warning_interval);
    expiry_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    warning_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "Dunning worker started (grace expiry every {}s, warnings every {}s)",
        expiry_interval.as_secs(),
        warning_interval.as_secs()
    );

    loop {
        tokio::select! {
            _ = expiry_ticker.tick() => {
                let now = chrono::Utc::now().naive_utc();
                if let Err(e) = dunning_uc.expire_grace_periods(now).await {
                    error!(error = %e, "Grace expiry sweep failed");
                }
            }
            _ = warning_ticker.tick() => {
                let now = chrono::Utc::now().naive_utc();
                if let Err(e) = dunning_uc.send_grace_warnings(now).await {
                    error!(error = %e, "Grace warning sweep failed");
                }
            }
        }
    }
}
