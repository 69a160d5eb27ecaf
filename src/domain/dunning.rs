//! Dunning: payment-failure tracking and the notifications it produces.

use chrono::NaiveDateTime;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{
    entities::{
        audit::actions,
        payment_failure::{NotificationKind, PaymentFailure},
        subscription::{SubscriptionStatus, Tier},
    },
    state_machine::{
        ENTITY_PAYMENT_FAILURE, ENTITY_SUBSCRIPTION, LockedSubscription, SkipReason,
        SubscriptionChange, Transition, TransitionContext, new_attempt,
    },
};

/// What we learned about a failed charge.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailureReport<'a> {
    pub invoice_id: Option<&'a str>,
    pub amount_due: Option<i64>,
    /// Provider's attempt counter. A value we have already counted adds no new attempt.
    pub provider_attempt: Option<i32>,
    pub reason: Option<&'a str>,
    pub next_retry_at: Option<NaiveDateTime>,
}

impl Transition<'_> {
    /// Opens or advances the failure for the reported invoice and schedules the next notice.
    pub(super) fn record_payment_failure(&mut self, report: &FailureReport<'_>) {
        let now = self.now();
        let existing = self
            .failures
            .iter()
            .position(|f| !f.resolved && f.matches_invoice(report.invoice_id));

        let (failure_id, attempt_number) = match existing {
            None => {
                let attempt_count = report.provider_attempt.unwrap_or(1).max(1);
                let failure = PaymentFailure {
                    id: Uuid::new_v4(),
                    subscription_id: self.sub.id,
                    provider_invoice_id: report.invoice_id.map(String::from),
                    amount_due: report.amount_due.unwrap_or(0),
                    attempt_count,
                    failure_reason: report.reason.map(String::from),
                    next_retry_at: report.next_retry_at,
                    resolved: false,
                    resolved_at: None,
                    created_at: now,
                    updated_at: now,
                };
                let id = failure.id;
                let subscription_id = self.sub.id;
                self.failures.push(failure);
                self.mark_failure_dirty(id);
                self.record(
                    actions::PAYMENT_FAILURE_OPENED,
                    ENTITY_PAYMENT_FAILURE,
                    id,
                    json!({
                        "subscription_id": subscription_id,
                        "invoice_id": report.invoice_id,
                        "amount_due": report.amount_due,
                        "attempt_count": attempt_count,
                    }),
                );
                (id, attempt_count)
            }
            Some(idx) => {
                let failure = &mut self.failures[idx];
                let next_count = match report.provider_attempt {
                    Some(n) if n <= failure.attempt_count => None,
                    Some(n) => Some(n),
                    None => Some(failure.attempt_count + 1),
                };

                if failure.provider_invoice_id.is_none() {
                    failure.provider_invoice_id = report.invoice_id.map(String::from);
                }
                if let Some(amount) = report.amount_due {
                    failure.amount_due = amount;
                }
                if let Some(reason) = report.reason {
                    failure.failure_reason = Some(reason.to_string());
                }
                if report.next_retry_at.is_some() {
                    failure.next_retry_at = report.next_retry_at;
                }
                if let Some(n) = next_count {
                    failure.attempt_count = n;
                }
                failure.updated_at = now;
                let id = failure.id;
                self.mark_failure_dirty(id);

                let Some(attempt_count) = next_count else {
                    debug!(
                        payment_failure_id = %id,
                        provider_attempt = ?report.provider_attempt,
                        "Payment attempt already recorded"
                    );
                    return;
                };
                self.record(
                    actions::PAYMENT_FAILURE_UPDATED,
                    ENTITY_PAYMENT_FAILURE,
                    id,
                    json!({ "attempt_count": attempt_count, "reason": report.reason }),
                );
                (id, attempt_count)
            }
        };

        if attempt_number > self.ctx.policy.max_dunning_attempts {
            info!(
                payment_failure_id = %failure_id,
                attempt_number,
                "Dunning notice budget used, no further notice before downgrade"
            );
            return;
        }

        let kind = NotificationKind::for_attempt(
            attempt_number,
            self.sub.grace_period_end,
            now,
            self.ctx.policy.grace_warning_window,
        );
        self.push_attempt(failure_id, attempt_number, kind);
    }

    pub(super) fn push_attempt(&mut self, failure_id: Uuid, attempt_number: i32, kind: NotificationKind) {
        let attempt = new_attempt(&self.sub, failure_id, attempt_number, kind, self.now());
        self.record(
            actions::DUNNING_ATTEMPT_RECORDED,
            ENTITY_PAYMENT_FAILURE,
            failure_id,
            json!({ "attempt_number": attempt_number, "kind": kind }),
        );
        self.new_attempts.push(attempt);
    }

    fn has_attempt(&self, failure_id: Uuid, kind: NotificationKind) -> bool {
        self.existing_attempts
            .iter()
            .chain(self.new_attempts.iter())
            .any(|a| a.payment_failure_id == failure_id && a.kind == kind)
    }

    fn next_attempt_number(&self, failure_id: Uuid) -> i32 {
        let recorded = self
            .existing_attempts
            .iter()
            .chain(self.new_attempts.iter())
            .filter(|a| a.payment_failure_id == failure_id)
            .map(|a| a.attempt_number)
            .max()
            .unwrap_or(0);
        let counted = self
            .failures
            .iter()
            .find(|f| f.id == failure_id)
            .map(|f| f.attempt_count)
            .unwrap_or(0);
        recorded.max(counted) + 1
    }

    /// The open failure dunning is tracking, opening one if the row is missing.
    fn current_failure(&mut self, reason: &str) -> Uuid {
        if let Some(failure) = self.failures.iter().find(|f| !f.resolved) {
            return failure.id;
        }
        let now = self.now();
        let failure = PaymentFailure {
            id: Uuid::new_v4(),
            subscription_id: self.sub.id,
            provider_invoice_id: None,
            amount_due: 0,
            attempt_count: 0,
            failure_reason: Some(reason.to_string()),
            next_retry_at: None,
            resolved: false,
            resolved_at: None,
            created_at: now,
            updated_at: now,
        };
        let id = failure.id;
        let subscription_id = self.sub.id;
        self.failures.push(failure);
        self.mark_failure_dirty(id);
        self.record(
            actions::PAYMENT_FAILURE_OPENED,
            ENTITY_PAYMENT_FAILURE,
            id,
            json!({ "subscription_id": subscription_id, "reason": reason }),
        );
        id
    }
}

/// Grace period ran out without a successful payment: notify, mark unpaid, drop to free.
pub fn on_grace_expired(locked: &LockedSubscription, ctx: &TransitionContext<'_>) -> SubscriptionChange {
    let sub = &locked.subscription;
    let expired = sub.status == SubscriptionStatus::PastDue
        && sub.grace_period_end.is_some_and(|end| end <= ctx.now);
    if !expired {
        return SubscriptionChange::skip(SkipReason::NotApplicable);
    }

    let mut t = Transition::new(locked, ctx);
    let failure_id = t.current_failure("grace_period_expired");
    let attempt_number = t.next_attempt_number(failure_id);
    t.push_attempt(failure_id, attempt_number, NotificationKind::SubscriptionDowngraded);

    let previous_tier = t.sub.tier;
    t.change_status(SubscriptionStatus::Unpaid);
    t.sub.tier = Tier::Free;
    let sub_id = t.sub.id;
    t.record(
        actions::SUBSCRIPTION_DOWNGRADED,
        ENTITY_SUBSCRIPTION,
        sub_id,
        json!({ "from_tier": previous_tier, "to_tier": Tier::Free }),
    );

    t.finish()
}

/// Sends the single grace-period warning once the end is within the warning window.
pub fn on_grace_warning_due(
    locked: &LockedSubscription,
    ctx: &TransitionContext<'_>,
) -> SubscriptionChange {
    let sub = &locked.subscription;
    let in_window = sub.status == SubscriptionStatus::PastDue
        && sub.grace_period_end.is_some_and(|end| {
            end > ctx.now && end - ctx.now <= ctx.policy.grace_warning_window
        });
    if !in_window {
        return SubscriptionChange::skip(SkipReason::NotApplicable);
    }

    let mut t = Transition::new(locked, ctx);
    let Some(failure_id) = t.failures.iter().find(|f| !f.resolved).map(|f| f.id) else {
        return SubscriptionChange::skip(SkipReason::NotApplicable);
    };
    if t.has_attempt(failure_id, NotificationKind::GracePeriodWarning) {
        return SubscriptionChange::skip(SkipReason::NotApplicable);
    }

    let attempt_number = t.next_attempt_number(failure_id);
    t.push_attempt(failure_id, attempt_number, NotificationKind::GracePeriodWarning);
    t.finish()
}
