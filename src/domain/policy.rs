use chrono::Duration;

use crate::domain::entities::subscription::Tier;

/// Business knobs the state machine and dunning workflow read.
///
/// Built once from configuration and handed to the use cases at construction.
#[derive(Debug, Clone)]
pub struct BillingPolicy {
    pub grace_period: Duration,
    pub max_dunning_attempts: i32,
    pub grace_warning_window: Duration,
    pub pro_price_ids: Vec<String>,
}

impl BillingPolicy {
    /// Resolves a provider price id to a tier. `None` means the price is not one we sell.
    pub fn tier_for_price(&self, price_id: Option<&str>) -> Option<Tier> {
        let price_id = price_id?;
        if self.pro_price_ids.iter().any(|p| p == price_id) {
            Some(Tier::Pro)
        } else {
            None
        }
    }
}

impl Default for BillingPolicy {
    fn default() -> Self {
        BillingPolicy {
            grace_period: Duration::days(3),
            max_dunning_attempts: 3,
            grace_warning_window: Duration::hours(48),
            pro_price_ids: Vec::new(),
        }
    }
}
