use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Kind of message sent to a user about a billing problem.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[derive(Default)]
pub enum NotificationKind {
    #[default]
    PaymentFailed,
    PaymentRetry,
    GracePeriodWarning,
    SubscriptionDowngraded,
}

impl NotificationKind {
    /// Picks the notification for a failed charge attempt.
    ///
    /// Attempt 1 is always `payment_failed`. Later attempts escalate to a grace warning
    /// from the third attempt on, or earlier when the grace period is about to run out.
    pub fn for_attempt(
        attempt_number: i32,
        grace_period_end: Option<NaiveDateTime>,
        now: NaiveDateTime,
        warning_window: Duration,
    ) -> Self {
        if attempt_number <= 1 {
            return NotificationKind::PaymentFailed;
        }
        let nearing_end = grace_period_end.is_some_and(|end| end - now <= warning_window);
        if attempt_number >= 3 || nearing_end {
            NotificationKind::GracePeriodWarning
        } else {
            NotificationKind::PaymentRetry
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentFailure {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub provider_invoice_id: Option<String>,
    pub amount_due: i64,
    pub attempt_count: i32,
    pub failure_reason: Option<String>,
    pub next_retry_at: Option<NaiveDateTime>,
    pub resolved: bool,
    pub resolved_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl PaymentFailure {
    /// Whether this open failure tracks the given invoice.
    ///
    /// A failure opened without an invoice reference (from a status update) adopts the
    /// first invoice that reports against it.
    pub fn matches_invoice(&self, invoice_id: Option<&str>) -> bool {
        match (self.provider_invoice_id.as_deref(), invoice_id) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }

    pub fn resolve(&mut self, now: NaiveDateTime) {
        self.resolved = true;
        self.resolved_at = Some(now);
        self.next_retry_at = None;
        self.updated_at = now;
    }
}

/// One notification about a payment failure. Rows are never edited except to mark delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DunningAttempt {
    pub id: Uuid,
    pub payment_failure_id: Uuid,
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub attempt_number: i32,
    pub kind: NotificationKind,
    pub sent: bool,
    pub sent_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}
