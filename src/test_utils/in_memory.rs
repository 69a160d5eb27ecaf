//! In-memory implementations of the repository traits and the notifier port.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult},
    application::{
        ports::notifier::Notifier,
        use_cases::{
            audit::AuditRepoTrait,
            ledger::{LedgerRepoTrait, NewInboundEvent},
            retry::{NewRetryItem, RetryQueueRepoTrait},
            subscription::{Decide, SubscriptionLocator, SubscriptionRepoTrait},
        },
    },
    domain::{
        entities::{
            audit::AuditEntry,
            ledger::{LedgerEntry, LedgerOutcome, ReserveResult},
            payment_failure::{DunningAttempt, NotificationKind, PaymentFailure},
            retry::{DeadLetterItem, RetryQueueItem, RetryQueueStats},
            subscription::{Subscription, SubscriptionStatus},
        },
        state_machine::{LockedSubscription, SubscriptionChange},
    },
};

type FailureFn = Box<dyn Fn() -> AppError + Send + Sync>;

// ============================================================================
// InMemoryBillingStore
// ============================================================================

/// Every table the reconciler touches, behind one struct so a single `Arc` can be handed
/// to each use case as whichever repository it needs.
#[derive(Default)]
pub struct InMemoryBillingStore {
    pub subscriptions: Mutex<HashMap<Uuid, Subscription>>,
    pub failures: Mutex<HashMap<Uuid, PaymentFailure>>,
    pub attempts: Mutex<Vec<DunningAttempt>>,
    pub audit: Mutex<Vec<AuditEntry>>,
    pub ledger: Mutex<HashMap<String, LedgerEntry>>,
    pub retry_queue: Mutex<HashMap<Uuid, RetryQueueItem>>,
    pub dead_letters: Mutex<Vec<DeadLetterItem>>,
    apply_failure: Mutex<Option<FailureFn>>,
    dead_letter_failure: Mutex<Option<FailureFn>>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_subscription(&self, subscription: Subscription) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(subscription.id, subscription);
    }

    pub fn subscription(&self, id: Uuid) -> Option<Subscription> {
        self.subscriptions.lock().unwrap().get(&id).cloned()
    }

    pub fn insert_failure(&self, failure: PaymentFailure) {
        self.failures.lock().unwrap().insert(failure.id, failure);
    }

    pub fn failures_for(&self, subscription_id: Uuid) -> Vec<PaymentFailure> {
        let mut failures: Vec<_> = self
            .failures
            .lock()
            .unwrap()
            .values()
            .filter(|f| f.subscription_id == subscription_id)
            .cloned()
            .collect();
        failures.sort_by_key(|f| f.created_at);
        failures
    }

    pub fn attempts_for(&self, subscription_id: Uuid) -> Vec<DunningAttempt> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.subscription_id == subscription_id)
            .cloned()
            .collect()
    }

    pub fn audit_for(&self, entity_id: Uuid) -> Vec<AuditEntry> {
        self.audit
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.entity_id == entity_id)
            .cloned()
            .collect()
    }

    pub fn ledger_entry(&self, event_id: &str) -> Option<LedgerEntry> {
        self.ledger.lock().unwrap().get(event_id).cloned()
    }

    pub fn queued(&self, event_id: &str) -> Option<RetryQueueItem> {
        self.retry_queue
            .lock()
            .unwrap()
            .values()
            .find(|i| i.event_id == event_id)
            .cloned()
    }

    pub fn dead_letter(&self, id: Uuid) -> Option<DeadLetterItem> {
        self.dead_letters
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.id == id)
            .cloned()
    }

    /// Makes every `apply_locked` call fail with the error `make` builds.
    pub fn fail_apply_with(&self, make: impl Fn() -> AppError + Send + Sync + 'static) {
        *self.apply_failure.lock().unwrap() = Some(Box::new(make));
    }

    pub fn clear_apply_failure(&self) {
        *self.apply_failure.lock().unwrap() = None;
    }

    /// Makes every dead letter insert fail with the error `make` builds.
    pub fn fail_dead_letter_with(&self, make: impl Fn() -> AppError + Send + Sync + 'static) {
        *self.dead_letter_failure.lock().unwrap() = Some(Box::new(make));
    }

    pub fn clear_dead_letter_failure(&self) {
        *self.dead_letter_failure.lock().unwrap() = None;
    }

    fn locate(subs: &HashMap<Uuid, Subscription>, locator: &SubscriptionLocator) -> Option<Uuid> {
        match locator {
            SubscriptionLocator::Id(id) => subs.get(id).map(|s| s.id),
            SubscriptionLocator::Provider {
                subscription_id,
                customer_id,
            } => subs
                .values()
                .find(|s| s.provider_subscription_id.as_deref() == Some(subscription_id))
                .or_else(|| {
                    let customer_id = customer_id.as_deref()?;
                    subs.values()
                        .filter(|s| {
                            s.provider_customer_id == customer_id
                                && s.provider_subscription_id.is_none()
                                && s.status != SubscriptionStatus::Canceled
                        })
                        .max_by_key(|s| s.created_at)
                })
                .map(|s| s.id),
            SubscriptionLocator::CurrentForUser(user_id) => {
                Self::current_for_user(subs, *user_id).map(|s| s.id)
            }
        }
    }

    fn current_for_user(subs: &HashMap<Uuid, Subscription>, user_id: Uuid) -> Option<&Subscription> {
        let mut owned: Vec<&Subscription> = subs.values().filter(|s| s.user_id == user_id).collect();
        owned.sort_by_key(|s| std::cmp::Reverse(s.created_at));
        owned
            .iter()
            .find(|s| s.status != SubscriptionStatus::Canceled)
            .or_else(|| owned.first())
            .copied()
    }
}

#[async_trait]
impl SubscriptionRepoTrait for InMemoryBillingStore {
    async fn create(
        &self,
        subscription: &Subscription,
        audit: &AuditEntry,
    ) -> AppResult<Subscription> {
        let mut subs = self.subscriptions.lock().unwrap();
        if subs
            .values()
            .any(|s| s.user_id == subscription.user_id && s.status != SubscriptionStatus::Canceled)
        {
            return Err(AppError::Conflict("User already has a live subscription".into()));
        }
        subs.insert(subscription.id, subscription.clone());
        self.audit.lock().unwrap().push(audit.clone());
        Ok(subscription.clone())
    }

    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<Subscription>> {
        Ok(self.subscription(id))
    }

    async fn find_current_for_user(&self, user_id: Uuid) -> AppResult<Option<Subscription>> {
        let subs = self.subscriptions.lock().unwrap();
        Ok(Self::current_for_user(&subs, user_id).cloned())
    }

    async fn apply_locked(
        &self,
        locator: &SubscriptionLocator,
        decide: Decide<'_>,
    ) -> AppResult<Option<SubscriptionChange>> {
        if let Some(make) = self.apply_failure.lock().unwrap().as_ref() {
            return Err(make());
        }

        // Holding the subscriptions lock for the whole call serializes transitions.
        let mut subs = self.subscriptions.lock().unwrap();
        let Some(id) = Self::locate(&subs, locator) else {
            return Ok(None);
        };
        let Some(subscription) = subs.get(&id).cloned() else {
            return Ok(None);
        };

        let mut failures = self.failures.lock().unwrap();
        let mut attempts = self.attempts.lock().unwrap();

        let mut open_failures: Vec<PaymentFailure> = failures
            .values()
            .filter(|f| f.subscription_id == id && !f.resolved)
            .cloned()
            .collect();
        open_failures.sort_by_key(|f| f.created_at);
        let open_ids: Vec<Uuid> = open_failures.iter().map(|f| f.id).collect();
        let history = attempts
            .iter()
            .filter(|a| open_ids.contains(&a.payment_failure_id))
            .cloned()
            .collect();

        let locked = LockedSubscription {
            subscription,
            open_failures,
            attempts: history,
        };
        let change = decide(&locked);

        if let Some(updated) = &change.subscription {
            subs.insert(updated.id, updated.clone());
        }
        for failure in &change.failures {
            failures.insert(failure.id, failure.clone());
        }
        attempts.extend(change.attempts.iter().cloned());
        self.audit.lock().unwrap().extend(change.audit.iter().cloned());

        Ok(Some(change))
    }

    async fn list_grace_expired(&self, now: NaiveDateTime, limit: i64) -> AppResult<Vec<Uuid>> {
        Ok(self
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .filter(|s| {
                s.status == SubscriptionStatus::PastDue
                    && s.grace_period_end.is_some_and(|end| end <= now)
            })
            .take(limit as usize)
            .map(|s| s.id)
            .collect())
    }

    async fn list_grace_ending(
        &self,
        now: NaiveDateTime,
        window_end: NaiveDateTime,
        limit: i64,
    ) -> AppResult<Vec<Uuid>> {
        Ok(self
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .filter(|s| {
                s.status == SubscriptionStatus::PastDue
                    && s.grace_period_end.is_some_and(|end| now < end && end <= window_end)
            })
            .take(limit as usize)
            .map(|s| s.id)
            .collect())
    }

    async fn mark_attempt_sent(&self, attempt_id: Uuid, sent_at: NaiveDateTime) -> AppResult<()> {
        let mut attempts = self.attempts.lock().unwrap();
        let attempt = attempts
            .iter_mut()
            .find(|a| a.id == attempt_id)
            .ok_or(AppError::NotFound)?;
        attempt.sent = true;
        attempt.sent_at = Some(sent_at);
        Ok(())
    }

    async fn list_failures(&self, subscription_id: Uuid) -> AppResult<Vec<PaymentFailure>> {
        Ok(self.failures_for(subscription_id))
    }

    async fn list_attempts_for_user(&self, user_id: Uuid, limit: i64) -> AppResult<Vec<DunningAttempt>> {
        let mut attempts: Vec<DunningAttempt> = self
            .attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| std::cmp::Reverse(a.created_at));
        attempts.truncate(limit as usize);
        Ok(attempts)
    }
}

#[async_trait]
impl LedgerRepoTrait for InMemoryBillingStore {
    async fn check_and_reserve(
        &self,
        event: &NewInboundEvent<'_>,
        now: NaiveDateTime,
    ) -> AppResult<ReserveResult> {
        let mut ledger = self.ledger.lock().unwrap();
        match ledger.get_mut(event.event_id) {
            None => {
                ledger.insert(
                    event.event_id.to_string(),
                    LedgerEntry {
                        event_id: event.event_id.to_string(),
                        event_type: event.event_type.to_string(),
                        provider: event.provider.to_string(),
                        payload: event.payload.to_string(),
                        outcome: LedgerOutcome::Pending,
                        last_error: None,
                        duplicate_count: 0,
                        replay_allowed: false,
                        received_at: now,
                        processed_at: None,
                    },
                );
                Ok(ReserveResult::FirstSeen)
            }
            Some(entry) if entry.replay_allowed => {
                entry.replay_allowed = false;
                entry.outcome = LedgerOutcome::Pending;
                entry.last_error = None;
                Ok(ReserveResult::FirstSeen)
            }
            Some(entry) => {
                entry.duplicate_count += 1;
                Ok(ReserveResult::AlreadySeen)
            }
        }
    }

    async fn record_outcome(
        &self,
        event_id: &str,
        outcome: LedgerOutcome,
        error: Option<&str>,
        now: NaiveDateTime,
    ) -> AppResult<()> {
        if let Some(entry) = self.ledger.lock().unwrap().get_mut(event_id) {
            entry.outcome = outcome;
            entry.last_error = error.map(String::from);
            entry.processed_at = Some(now);
        }
        Ok(())
    }

    async fn reset_for_replay(&self, event_id: &str) -> AppResult<bool> {
        match self.ledger.lock().unwrap().get_mut(event_id) {
            Some(entry) => {
                entry.replay_allowed = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, event_id: &str) -> AppResult<Option<LedgerEntry>> {
        Ok(self.ledger_entry(event_id))
    }
}

#[async_trait]
impl RetryQueueRepoTrait for InMemoryBillingStore {
    async fn enqueue(&self, item: &NewRetryItem<'_>, now: NaiveDateTime) -> AppResult<bool> {
        let mut queue = self.retry_queue.lock().unwrap();
        if queue.values().any(|i| i.event_id == item.event_id) {
            return Ok(false);
        }
        let id = Uuid::new_v4();
        queue.insert(
            id,
            RetryQueueItem {
                id,
                event_id: item.event_id.to_string(),
                event_type: item.event_type.to_string(),
                payload: item.payload.to_string(),
                retry_count: 0,
                max_retries: item.max_retries,
                next_retry_at: item.next_retry_at,
                last_error: Some(item.last_error.to_string()),
                claimed_until: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(true)
    }

    async fn claim_due(
        &self,
        now: NaiveDateTime,
        lease_until: NaiveDateTime,
        limit: i64,
    ) -> AppResult<Vec<RetryQueueItem>> {
        let mut queue = self.retry_queue.lock().unwrap();
        let mut due: Vec<&mut RetryQueueItem> = queue
            .values_mut()
            .filter(|i| i.next_retry_at <= now && i.claimed_until.is_none_or(|c| c < now))
            .collect();
        due.sort_by_key(|i| i.next_retry_at);

        Ok(due
            .into_iter()
            .take(limit as usize)
            .map(|item| {
                item.claimed_until = Some(lease_until);
                item.clone()
            })
            .collect())
    }

    async fn reschedule(
        &self,
        id: Uuid,
        lease: NaiveDateTime,
        retry_count: i32,
        next_retry_at: NaiveDateTime,
        last_error: &str,
        now: NaiveDateTime,
    ) -> AppResult<bool> {
        let mut queue = self.retry_queue.lock().unwrap();
        let Some(item) = queue.get_mut(&id).filter(|i| i.claimed_until == Some(lease)) else {
            return Ok(false);
        };
        item.retry_count = retry_count;
        item.next_retry_at = next_retry_at;
        item.last_error = Some(last_error.to_string());
        item.claimed_until = None;
        item.updated_at = now;
        Ok(true)
    }

    async fn complete(&self, id: Uuid, lease: NaiveDateTime) -> AppResult<bool> {
        let mut queue = self.retry_queue.lock().unwrap();
        if queue.get(&id).is_some_and(|i| i.claimed_until == Some(lease)) {
            queue.remove(&id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn move_to_dead_letter(
        &self,
        id: Uuid,
        lease: NaiveDateTime,
        dead_letter: &DeadLetterItem,
    ) -> AppResult<bool> {
        let mut queue = self.retry_queue.lock().unwrap();
        if !queue.get(&id).is_some_and(|i| i.claimed_until == Some(lease)) {
            return Ok(false);
        }
        queue.remove(&id);
        self.dead_letters.lock().unwrap().push(dead_letter.clone());
        Ok(true)
    }

    async fn insert_dead_letter(&self, item: &DeadLetterItem) -> AppResult<()> {
        if let Some(make) = self.dead_letter_failure.lock().unwrap().as_ref() {
            return Err(make());
        }
        self.dead_letters.lock().unwrap().push(item.clone());
        Ok(())
    }

    async fn list_dead_letters(&self, limit: i64) -> AppResult<Vec<DeadLetterItem>> {
        let mut items = self.dead_letters.lock().unwrap().clone();
        items.sort_by_key(|d| std::cmp::Reverse(d.failed_at));
        items.truncate(limit as usize);
        Ok(items)
    }

    async fn get_dead_letter(&self, id: Uuid) -> AppResult<Option<DeadLetterItem>> {
        Ok(self.dead_letter(id))
    }

    async fn annotate_dead_letter(
        &self,
        id: Uuid,
        note: &str,
        operator: &str,
        now: NaiveDateTime,
    ) -> AppResult<Option<DeadLetterItem>> {
        let mut items = self.dead_letters.lock().unwrap();
        Ok(items.iter_mut().find(|d| d.id == id).map(|item| {
            item.operator_note = Some(note.to_string());
            item.annotated_by = Some(operator.to_string());
            item.annotated_at = Some(now);
            item.clone()
        }))
    }

    async fn mark_dead_letter_replayed(&self, id: Uuid, now: NaiveDateTime) -> AppResult<()> {
        let mut items = self.dead_letters.lock().unwrap();
        let item = items.iter_mut().find(|d| d.id == id).ok_or(AppError::NotFound)?;
        item.replayed_at = Some(now);
        item.replay_count += 1;
        Ok(())
    }

    async fn stats(&self, now: NaiveDateTime) -> AppResult<RetryQueueStats> {
        let queue = self.retry_queue.lock().unwrap();
        Ok(RetryQueueStats {
            pending: queue.len() as i64,
            due: queue.values().filter(|i| i.next_retry_at <= now).count() as i64,
            dead_letters: self.dead_letters.lock().unwrap().len() as i64,
        })
    }

    async fn get_by_event(&self, event_id: &str) -> AppResult<Option<RetryQueueItem>> {
        Ok(self.queued(event_id))
    }
}

#[async_trait]
impl AuditRepoTrait for InMemoryBillingStore {
    async fn list_by_entity(&self, entity_id: Uuid, limit: i64) -> AppResult<Vec<AuditEntry>> {
        let mut entries = self.audit_for(entity_id);
        entries.sort_by_key(|a| std::cmp::Reverse(a.created_at));
        entries.truncate(limit as usize);
        Ok(entries)
    }
}

// ============================================================================
// RecordingNotifier
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub payload: JsonValue,
}

/// Records every notice instead of sending it. `failing()` rejects every notice.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, user_id: Uuid, kind: NotificationKind, payload: JsonValue) -> AppResult<()> {
        if self.fail {
            return Err(AppError::Internal("notifier unavailable".into()));
        }
        self.sent.lock().unwrap().push(SentNotification {
            user_id,
            kind,
            payload,
        });
        Ok(())
    }
}
