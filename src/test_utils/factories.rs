//! Test data factories for creating valid test fixtures.
//!
//! Each factory function creates a complete, valid object with sensible defaults.
//! Use the closure parameter to override specific fields as needed.

use std::sync::Arc;

use chrono::{Duration, NaiveDateTime};
use uuid::Uuid;

use crate::{
    application::use_cases::{
        dunning::NotificationDispatcher, reconcile::ReconcileUseCases, retry::RetryPolicy,
    },
    domain::{
        entities::{
            payment_failure::{DunningAttempt, NotificationKind, PaymentFailure},
            subscription::{Subscription, SubscriptionStatus, Tier},
        },
        policy::BillingPolicy,
    },
    test_utils::{InMemoryBillingStore, RecordingNotifier},
};

pub const TEST_PRO_PRICE: &str = "price_pro";

/// Policy with the production defaults and one known pro price.
pub fn test_policy() -> BillingPolicy {
    BillingPolicy {
        pro_price_ids: vec![TEST_PRO_PRICE.to_string()],
        ..Default::default()
    }
}

/// Create an active pro subscription linked to `sub_1` / `cus_1`.
pub fn create_test_subscription(overrides: impl FnOnce(&mut Subscription)) -> Subscription {
    let mut sub = Subscription {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        provider_customer_id: "cus_1".to_string(),
        provider_subscription_id: Some("sub_1".to_string()),
        provider_price_id: Some(TEST_PRO_PRICE.to_string()),
        status: SubscriptionStatus::Active,
        tier: Tier::Pro,
        current_period_start: Some(test_datetime()),
        current_period_end: Some(test_datetime() + Duration::days(30)),
        cancel_at_period_end: false,
        trial_start: None,
        trial_end: None,
        grace_period_end: None,
        canceled_at: None,
        last_event_at: None,
        created_at: test_datetime(),
        updated_at: test_datetime(),
    };
    overrides(&mut sub);
    sub
}

/// Create an open payment failure for `in_1` after one provider attempt.
pub fn create_test_failure(
    subscription_id: Uuid,
    overrides: impl FnOnce(&mut PaymentFailure),
) -> PaymentFailure {
    let mut failure = PaymentFailure {
        id: Uuid::new_v4(),
        subscription_id,
        provider_invoice_id: Some("in_1".to_string()),
        amount_due: 1900,
        attempt_count: 1,
        failure_reason: Some("card_declined".to_string()),
        next_retry_at: None,
        resolved: false,
        resolved_at: None,
        created_at: test_datetime(),
        updated_at: test_datetime(),
    };
    overrides(&mut failure);
    failure
}

/// A sent `payment_failed` notice for `failure_id`.
pub fn create_test_attempt(sub: &Subscription, failure_id: Uuid, attempt_number: i32) -> DunningAttempt {
    DunningAttempt {
        id: Uuid::new_v4(),
        payment_failure_id: failure_id,
        subscription_id: sub.id,
        user_id: sub.user_id,
        attempt_number,
        kind: NotificationKind::PaymentFailed,
        sent: true,
        sent_at: Some(test_datetime()),
        created_at: test_datetime(),
    }
}

/// Reconciler over the in-memory store with a notifier nobody inspects.
pub fn reconcile_use_cases(
    store: &Arc<InMemoryBillingStore>,
    policy: BillingPolicy,
    retry_policy: RetryPolicy,
) -> ReconcileUseCases {
    reconcile_use_cases_with_notifier(store, Arc::new(RecordingNotifier::new()), policy, retry_policy)
}

pub fn reconcile_use_cases_with_notifier(
    store: &Arc<InMemoryBillingStore>,
    notifier: Arc<RecordingNotifier>,
    policy: BillingPolicy,
    retry_policy: RetryPolicy,
) -> ReconcileUseCases {
    let dispatcher = Arc::new(NotificationDispatcher::new(notifier, store.clone()));
    ReconcileUseCases::new(
        "stripe".to_string(),
        store.clone(),
        store.clone(),
        store.clone(),
        dispatcher,
        policy,
        retry_policy,
        std::time::Duration::from_secs(10),
    )
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Returns a consistent test datetime (2024-01-15 12:00:00 UTC).
pub fn test_datetime() -> NaiveDateTime {
    NaiveDateTime::parse_from_str("2024-01-15 12:00:00", "%Y-%m-%d %H:%M:%S").unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_subscription_with_defaults() {
        let sub = create_test_subscription(|_| {});
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.tier, Tier::Pro);
        assert!(test_policy().tier_for_price(sub.provider_price_id.as_deref()).is_some());
    }

    #[test]
    fn test_create_failure_with_overrides() {
        let sub_id = Uuid::new_v4();
        let failure = create_test_failure(sub_id, |f| f.attempt_count = 3);
        assert_eq!(failure.subscription_id, sub_id);
        assert_eq!(failure.attempt_count, 3);
        assert!(!failure.resolved);
    }
}
