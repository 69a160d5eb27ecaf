use std::sync::Arc;

use chrono::NaiveDateTime;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    app_error::AppResult,
    application::{
        ports::notifier::Notifier,
        use_cases::subscription::{SubscriptionLocator, SubscriptionRepoTrait},
    },
    domain::{
        dunning::{on_grace_expired, on_grace_warning_due},
        entities::audit::Actor,
        policy::BillingPolicy,
        state_machine::{LockedSubscription, SubscriptionChange, TransitionContext},
    },
};

pub const SWEEP_BATCH_SIZE: i64 = 100;

/// Sends the notices recorded by a committed change and marks the delivered ones.
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    repo: Arc<dyn SubscriptionRepoTrait>,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, repo: Arc<dyn SubscriptionRepoTrait>) -> Self {
        Self { notifier, repo }
    }

    /// Never fails: a lost notice leaves the attempt unsent and is only logged.
    pub async fn dispatch(&self, change: &SubscriptionChange, now: NaiveDateTime) {
        for attempt in &change.attempts {
            let payload = json!({
                "subscription_id": attempt.subscription_id,
                "payment_failure_id": attempt.payment_failure_id,
                "attempt_number": attempt.attempt_number,
                "status": change.subscription.as_ref().map(|s| s.status),
                "tier": change.subscription.as_ref().map(|s| s.tier),
                "grace_period_end": change.subscription.as_ref().and_then(|s| s.grace_period_end),
            });

            if let Err(e) = self.notifier.notify(attempt.user_id, attempt.kind, payload).await {
                warn!(
                    attempt_id = %attempt.id,
                    user_id = %attempt.user_id,
                    kind = %attempt.kind,
                    error = %e,
                    "Failed to send dunning notice"
                );
                continue;
            }

            if let Err(e) = self.repo.mark_attempt_sent(attempt.id, now).await {
                error!(attempt_id = %attempt.id, error = %e, "Failed to mark dunning notice sent");
            }
        }
    }
}

/// Time-driven half of dunning: grace expiry and the advance warning.
pub struct DunningUseCases {
    repo: Arc<dyn SubscriptionRepoTrait>,
    dispatcher: Arc<NotificationDispatcher>,
    policy: BillingPolicy,
}

impl DunningUseCases {
    pub fn new(
        repo: Arc<dyn SubscriptionRepoTrait>,
        dispatcher: Arc<NotificationDispatcher>,
        policy: BillingPolicy,
    ) -> Self {
        Self {
            repo,
            dispatcher,
            policy,
        }
    }

    /// Downgrades every `past_due` subscription whose grace period has run out.
    /// Returns how many were downgraded.
    pub async fn expire_grace_periods(&self, now: NaiveDateTime) -> AppResult<usize> {
        let ids = self.repo.list_grace_expired(now, SWEEP_BATCH_SIZE).await?;
        let applied = self.sweep(&ids, now, on_grace_expired).await;
        if applied > 0 {
            info!(count = applied, "Downgraded subscriptions after grace period");
        }
        Ok(applied)
    }

    /// Sends the grace warning to subscriptions whose grace ends within the warning window.
    pub async fn send_grace_warnings(&self, now: NaiveDateTime) -> AppResult<usize> {
        let window_end = now + self.policy.grace_warning_window;
        let ids = self
            .repo
            .list_grace_ending(now, window_end, SWEEP_BATCH_SIZE)
            .await?;
        let applied = self.sweep(&ids, now, on_grace_warning_due).await;
        if applied > 0 {
            info!(count = applied, "Sent grace period warnings");
        }
        Ok(applied)
    }

    async fn sweep(
        &self,
        ids: &[Uuid],
        now: NaiveDateTime,
        rule: fn(&LockedSubscription, &TransitionContext<'_>) -> SubscriptionChange,
    ) -> usize {
        let policy = &self.policy;
        let decide = move |locked: &LockedSubscription| {
            let ctx = TransitionContext {
                policy,
                actor: Actor::System,
                now,
                event_id: None,
            };
            rule(locked, &ctx)
        };

        let mut applied = 0;
        for id in ids {
            // Re-checked under the lock: a payment may have landed since the list was read.
            match self
                .repo
                .apply_locked(&SubscriptionLocator::Id(*id), &decide)
                .await
            {
                Ok(Some(change)) if !change.is_noop() => {
                    self.dispatcher.dispatch(&change, now).await;
                    applied += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(subscription_id = %id, error = %e, "Dunning sweep failed for subscription");
                }
            }
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::{
        domain::entities::{
            payment_failure::NotificationKind,
            subscription::{SubscriptionStatus, Tier},
        },
        test_utils::{
            InMemoryBillingStore, RecordingNotifier, create_test_failure,
            create_test_subscription, test_policy,
        },
    };

    fn setup() -> (Arc<InMemoryBillingStore>, Arc<RecordingNotifier>, DunningUseCases) {
        let store = Arc::new(InMemoryBillingStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let dispatcher = Arc::new(NotificationDispatcher::new(notifier.clone(), store.clone()));
        let uc = DunningUseCases::new(store.clone(), dispatcher, test_policy());
        (store, notifier, uc)
    }

    #[tokio::test]
    async fn expired_grace_downgrades_and_notifies() {
        let (store, notifier, uc) = setup();
        let now = chrono::Utc::now().naive_utc();
        let sub = create_test_subscription(|s| {
            s.status = SubscriptionStatus::PastDue;
            s.grace_period_end = Some(now - Duration::minutes(5));
        });
        store.insert_subscription(sub.clone());
        store.insert_failure(create_test_failure(sub.id, |f| f.attempt_count = 3));

        let count = uc.expire_grace_periods(now).await.unwrap();

        assert_eq!(count, 1);
        let updated = store.subscription(sub.id).unwrap();
        assert_eq!(updated.status, SubscriptionStatus::Unpaid);
        assert_eq!(updated.tier, Tier::Free);
        assert!(!updated.is_entitled(now));

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::SubscriptionDowngraded);

        let attempts = store.attempts_for(sub.id);
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].sent);
    }

    #[tokio::test]
    async fn running_expiry_twice_downgrades_once() {
        let (store, notifier, uc) = setup();
        let now = chrono::Utc::now().naive_utc();
        let sub = create_test_subscription(|s| {
            s.status = SubscriptionStatus::PastDue;
            s.grace_period_end = Some(now - Duration::minutes(5));
        });
        store.insert_subscription(sub);

        assert_eq!(uc.expire_grace_periods(now).await.unwrap(), 1);
        assert_eq!(uc.expire_grace_periods(now).await.unwrap(), 0);
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn warning_goes_out_once_inside_window() {
        let (store, notifier, uc) = setup();
        let now = chrono::Utc::now().naive_utc();
        let sub = create_test_subscription(|s| {
            s.status = SubscriptionStatus::PastDue;
            s.grace_period_end = Some(now + Duration::hours(20));
        });
        store.insert_subscription(sub.clone());
        store.insert_failure(create_test_failure(sub.id, |_| {}));

        assert_eq!(uc.send_grace_warnings(now).await.unwrap(), 1);
        assert_eq!(uc.send_grace_warnings(now + Duration::hours(1)).await.unwrap(), 0);

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::GracePeriodWarning);
        // Warnings do not touch entitlement.
        assert!(store.subscription(sub.id).unwrap().is_entitled(now));
    }

    #[tokio::test]
    async fn notifier_failure_leaves_attempt_unsent() {
        let store = Arc::new(InMemoryBillingStore::new());
        let notifier = Arc::new(RecordingNotifier::failing());
        let dispatcher = Arc::new(NotificationDispatcher::new(notifier.clone(), store.clone()));
        let uc = DunningUseCases::new(store.clone(), dispatcher, test_policy());
        let now = chrono::Utc::now().naive_utc();
        let sub = create_test_subscription(|s| {
            s.status = SubscriptionStatus::PastDue;
            s.grace_period_end = Some(now - Duration::minutes(5));
        });
        store.insert_subscription(sub.clone());

        assert_eq!(uc.expire_grace_periods(now).await.unwrap(), 1);

        assert_eq!(store.subscription(sub.id).unwrap().status, SubscriptionStatus::Unpaid);
        let attempts = store.attempts_for(sub.id);
        assert_eq!(attempts.len(), 1);
        assert!(!attempts[0].sent);
    }
}
