//! Subscription lifecycle transitions.
//!
//! Every function here is pure: it receives the subscription as read under its row lock and
//! returns a [`SubscriptionChange`] describing what to write. The persistence layer applies the
//! change inside the same transaction that holds the lock.

use chrono::NaiveDateTime;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{
    dunning::FailureReport,
    entities::{
        audit::{Actor, AuditEntry, actions},
        billing_event::{InvoiceSnapshot, PaymentIntentSnapshot, SubscriptionSnapshot},
        payment_failure::{DunningAttempt, NotificationKind, PaymentFailure},
        subscription::{Subscription, SubscriptionStatus, Tier},
    },
    policy::BillingPolicy,
};

pub const ENTITY_SUBSCRIPTION: &str = "subscription";
pub const ENTITY_PAYMENT_FAILURE: &str = "payment_failure";

/// A subscription row as read under `SELECT ... FOR UPDATE`, plus its unresolved failures.
#[derive(Debug, Clone)]
pub struct LockedSubscription {
    pub subscription: Subscription,
    pub open_failures: Vec<PaymentFailure>,
    /// Dunning history of the open failures.
    pub attempts: Vec<DunningAttempt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Event predates the last applied event.
    StaleEvent,
    /// Subscription is canceled; its lifecycle is over.
    Terminal,
    /// Nothing in the event applies to the current state.
    NotApplicable,
}

/// Writes produced by one transition, applied atomically.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionChange {
    pub subscription: Option<Subscription>,
    /// Inserted or updated failures, keyed by id.
    pub failures: Vec<PaymentFailure>,
    /// New dunning attempts. Each is dispatched to the notifier after commit.
    pub attempts: Vec<DunningAttempt>,
    pub audit: Vec<AuditEntry>,
    pub skipped: Option<SkipReason>,
}

impl SubscriptionChange {
    pub fn skip(reason: SkipReason) -> Self {
        SubscriptionChange {
            skipped: Some(reason),
            ..Default::default()
        }
    }

    pub fn is_noop(&self) -> bool {
        self.subscription.is_none()
            && self.failures.is_empty()
            && self.attempts.is_empty()
            && self.audit.is_empty()
    }
}

pub struct TransitionContext<'a> {
    pub policy: &'a BillingPolicy,
    pub actor: Actor,
    pub now: NaiveDateTime,
    /// Provider event being applied, recorded in audit metadata.
    pub event_id: Option<&'a str>,
}

/// Working copy of a locked subscription while a transition is computed.
pub(crate) struct Transition<'a> {
    pub(super) ctx: &'a TransitionContext<'a>,
    pub(super) before: &'a Subscription,
    pub(super) sub: Subscription,
    pub(super) failures: Vec<PaymentFailure>,
    pub(super) existing_attempts: &'a [DunningAttempt],
    pub(super) new_attempts: Vec<DunningAttempt>,
    pub(super) dirty_failures: Vec<Uuid>,
    pub(super) audit: Vec<AuditEntry>,
}

impl<'a> Transition<'a> {
    pub(super) fn new(locked: &'a LockedSubscription, ctx: &'a TransitionContext<'a>) -> Self {
        Transition {
            ctx,
            before: &locked.subscription,
            sub: locked.subscription.clone(),
            failures: locked.open_failures.clone(),
            existing_attempts: &locked.attempts,
            new_attempts: Vec::new(),
            dirty_failures: Vec::new(),
            audit: Vec::new(),
        }
    }

    pub(super) fn now(&self) -> NaiveDateTime {
        self.ctx.now
    }

    pub(super) fn record(&mut self, action: &str, entity_type: &str, entity_id: Uuid, mut metadata: JsonValue) {
        if let (Some(event_id), Some(map)) = (self.ctx.event_id, metadata.as_object_mut()) {
            map.insert("event_id".into(), json!(event_id));
        }
        self.audit.push(AuditEntry::new(
            self.ctx.actor,
            action,
            entity_type,
            entity_id,
            metadata,
            self.ctx.now,
        ));
    }

    pub(super) fn mark_failure_dirty(&mut self, id: Uuid) {
        if !self.dirty_failures.contains(&id) {
            self.dirty_failures.push(id);
        }
    }

    /// Moves the subscription to `to` and applies the status's entry effects.
    ///
    /// Returns false, changing nothing, when the move is not in the transition table.
    pub(super) fn change_status(&mut self, to: SubscriptionStatus) -> bool {
        let from = self.sub.status;
        if from == to {
            return false;
        }
        if !from.can_transition_to(to) {
            info!(
                subscription_id = %self.sub.id,
                from = %from,
                to = %to,
                "Ignoring status transition not allowed from current state"
            );
            return false;
        }

        let now = self.now();
        self.sub.status = to;
        match to {
            SubscriptionStatus::PastDue => {
                self.sub.grace_period_end = Some(now + self.ctx.policy.grace_period);
            }
            SubscriptionStatus::Active => {
                self.sub.grace_period_end = None;
                self.resolve_failures(None, "subscription_recovered");
                if from == SubscriptionStatus::Unpaid
                    && let Some(tier) = self
                        .ctx
                        .policy
                        .tier_for_price(self.sub.provider_price_id.as_deref())
                {
                    self.sub.tier = tier;
                }
            }
            SubscriptionStatus::Canceled => {
                self.sub.canceled_at = Some(now);
                self.sub.grace_period_end = None;
                self.sub.cancel_at_period_end = false;
                self.sub.tier = Tier::Free;
                self.resolve_failures(None, "subscription_canceled");
            }
            _ => {}
        }

        let sub_id = self.sub.id;
        let grace_period_end = self.sub.grace_period_end;
        self.record(
            actions::SUBSCRIPTION_STATUS_CHANGED,
            ENTITY_SUBSCRIPTION,
            sub_id,
            json!({ "from": from, "to": to, "grace_period_end": grace_period_end }),
        );
        if to == SubscriptionStatus::Canceled {
            self.record(
                actions::SUBSCRIPTION_CANCELED,
                ENTITY_SUBSCRIPTION,
                sub_id,
                json!({ "previous_status": from }),
            );
        }
        true
    }

    /// Resolves open failures for `invoice_id`, or all open failures when `None`.
    pub(super) fn resolve_failures(&mut self, invoice_id: Option<&str>, reason: &str) {
        let now = self.now();
        let mut resolved = Vec::new();
        for failure in self.failures.iter_mut().filter(|f| !f.resolved) {
            if failure.matches_invoice(invoice_id) {
                failure.resolve(now);
                resolved.push(failure.id);
            }
        }
        for id in resolved {
            self.mark_failure_dirty(id);
            self.record(
                actions::PAYMENT_FAILURE_RESOLVED,
                ENTITY_PAYMENT_FAILURE,
                id,
                json!({ "reason": reason }),
            );
        }
    }

    pub(super) fn finish(mut self) -> SubscriptionChange {
        let subscription = if self.sub != *self.before {
            self.sub.updated_at = self.ctx.now;
            Some(self.sub)
        } else {
            None
        };
        let dirty = self.dirty_failures;
        let failures = self
            .failures
            .into_iter()
            .filter(|f| dirty.contains(&f.id))
            .collect();

        SubscriptionChange {
            subscription,
            failures,
            attempts: self.new_attempts,
            audit: self.audit,
            skipped: None,
        }
    }
}

/// Applies a `customer.subscription.*` event.
pub fn on_subscription_event(
    locked: &LockedSubscription,
    snapshot: &SubscriptionSnapshot,
    event_created: NaiveDateTime,
    deleted: bool,
    ctx: &TransitionContext<'_>,
) -> SubscriptionChange {
    let current = &locked.subscription;
    if current.status.is_terminal() {
        debug!(subscription_id = %current.id, "Subscription already canceled, ignoring event");
        return SubscriptionChange::skip(SkipReason::Terminal);
    }
    if current.is_stale(event_created) {
        info!(
            subscription_id = %current.id,
            event_created = %event_created,
            last_event_at = ?current.last_event_at,
            "Stale subscription event, no state change"
        );
        return SubscriptionChange::skip(SkipReason::StaleEvent);
    }

    let mut t = Transition::new(locked, ctx);
    let sub_id = t.sub.id;

    if t.sub.provider_subscription_id.is_none() {
        t.sub.provider_subscription_id = Some(snapshot.provider_subscription_id.clone());
        t.record(
            actions::SUBSCRIPTION_LINKED,
            ENTITY_SUBSCRIPTION,
            sub_id,
            json!({ "provider_subscription_id": snapshot.provider_subscription_id }),
        );
    }
    t.sub.provider_customer_id = snapshot.provider_customer_id.clone();
    t.sub.current_period_start = snapshot.current_period_start.or(t.sub.current_period_start);
    t.sub.current_period_end = snapshot.current_period_end.or(t.sub.current_period_end);
    t.sub.cancel_at_period_end = snapshot.cancel_at_period_end;
    t.sub.trial_start = snapshot.trial_start.or(t.sub.trial_start);
    t.sub.trial_end = snapshot.trial_end.or(t.sub.trial_end);
    t.sub.last_event_at = Some(event_created);

    let known_tier = t.ctx.policy.tier_for_price(snapshot.price_id.as_deref());
    if snapshot.price_id.is_some() && snapshot.price_id != t.sub.provider_price_id {
        let old_price = t.sub.provider_price_id.replace(snapshot.price_id.clone().unwrap_or_default());
        let old_tier = t.sub.tier;
        if let Some(tier) = known_tier
            && t.sub.status != SubscriptionStatus::Incomplete
        {
            t.sub.tier = tier;
        }
        if old_price.is_some() {
            t.record(
                actions::SUBSCRIPTION_PLAN_CHANGED,
                ENTITY_SUBSCRIPTION,
                sub_id,
                json!({
                    "from_price": old_price,
                    "to_price": snapshot.price_id,
                    "from_tier": old_tier,
                    "to_tier": t.sub.tier,
                }),
            );
        }
    }

    let target = if deleted {
        Some(SubscriptionStatus::Canceled)
    } else {
        SubscriptionStatus::from_provider(&snapshot.status)
    };

    match target {
        None => {
            info!(
                subscription_id = %sub_id,
                provider_status = %snapshot.status,
                "Unrecognized provider status, keeping local status"
            );
        }
        Some(to) => {
            let from = t.sub.status;
            let activating = from == SubscriptionStatus::Incomplete
                && matches!(to, SubscriptionStatus::Active | SubscriptionStatus::Trialing);
            if activating && known_tier.is_none() {
                info!(
                    subscription_id = %sub_id,
                    price_id = ?snapshot.price_id,
                    "Price does not map to a known tier, not activating"
                );
            } else if t.change_status(to) {
                if activating && let Some(tier) = known_tier {
                    t.sub.tier = tier;
                }
                if to == SubscriptionStatus::PastDue {
                    t.record_payment_failure(&FailureReport {
                        invoice_id: snapshot.latest_invoice_id.as_deref(),
                        ..Default::default()
                    });
                }
            }
        }
    }

    t.finish()
}

/// Applies `invoice.paid` / `invoice.payment_succeeded`.
pub fn on_invoice_paid(
    locked: &LockedSubscription,
    invoice: &InvoiceSnapshot,
    event_created: NaiveDateTime,
    ctx: &TransitionContext<'_>,
) -> SubscriptionChange {
    let current = &locked.subscription;
    if current.status.is_terminal() {
        return SubscriptionChange::skip(SkipReason::Terminal);
    }
    if current.is_stale(event_created) {
        info!(subscription_id = %current.id, invoice_id = %invoice.provider_invoice_id, "Stale invoice event, no state change");
        return SubscriptionChange::skip(SkipReason::StaleEvent);
    }

    let mut t = Transition::new(locked, ctx);
    t.sub.last_event_at = Some(event_created);
    t.resolve_failures(Some(&invoice.provider_invoice_id), "payment_succeeded");

    if matches!(
        t.sub.status,
        SubscriptionStatus::PastDue | SubscriptionStatus::Unpaid
    ) {
        t.change_status(SubscriptionStatus::Active);
    }

    t.finish()
}

/// Applies `invoice.payment_failed`: enters `past_due` if needed and records a dunning attempt.
pub fn on_invoice_payment_failed(
    locked: &LockedSubscription,
    invoice: &InvoiceSnapshot,
    event_created: NaiveDateTime,
    ctx: &TransitionContext<'_>,
) -> SubscriptionChange {
    let current = &locked.subscription;
    if current.status.is_terminal() {
        return SubscriptionChange::skip(SkipReason::Terminal);
    }
    if current.is_stale(event_created) {
        info!(subscription_id = %current.id, invoice_id = %invoice.provider_invoice_id, "Stale invoice event, no state change");
        return SubscriptionChange::skip(SkipReason::StaleEvent);
    }
    if !current.status.is_billable() {
        info!(
            subscription_id = %current.id,
            status = %current.status,
            "Payment failure for subscription that is not billable yet"
        );
        return SubscriptionChange::skip(SkipReason::NotApplicable);
    }

    let mut t = Transition::new(locked, ctx);
    t.sub.last_event_at = Some(event_created);
    if matches!(
        t.sub.status,
        SubscriptionStatus::Active | SubscriptionStatus::Trialing
    ) {
        t.change_status(SubscriptionStatus::PastDue);
    }
    t.record_payment_failure(&FailureReport {
        invoice_id: Some(&invoice.provider_invoice_id),
        amount_due: Some(invoice.amount_due),
        provider_attempt: invoice.attempt_count,
        reason: invoice.failure_reason.as_deref(),
        next_retry_at: invoice.next_payment_attempt,
    });

    t.finish()
}

/// Records a payment intent outcome on the subscription's audit trail. Status and the
/// ordering marker are left alone: the matching invoice event drives the lifecycle.
pub fn on_payment_intent(
    locked: &LockedSubscription,
    intent: &PaymentIntentSnapshot,
    succeeded: bool,
    ctx: &TransitionContext<'_>,
) -> SubscriptionChange {
    let mut t = Transition::new(locked, ctx);
    let sub_id = t.sub.id;
    let mut metadata = json!({
        "payment_intent_id": intent.provider_payment_intent_id,
        "amount_cents": intent.amount,
        "currency": intent.currency,
        "status": intent.status,
        "provider_customer_id": intent.provider_customer_id,
    });
    let action = if succeeded {
        actions::PAYMENT_INTENT_SUCCEEDED
    } else {
        if let Some(map) = metadata.as_object_mut() {
            map.insert("error_code".into(), json!(intent.error_code));
            map.insert("error_message".into(), json!(intent.error_message));
        }
        actions::PAYMENT_INTENT_FAILED
    };
    t.record(action, ENTITY_SUBSCRIPTION, sub_id, metadata);
    t.finish()
}

/// Immediate cancel requested by the user. Runs through the same locked path as webhooks.
pub fn on_user_cancel(locked: &LockedSubscription, ctx: &TransitionContext<'_>) -> SubscriptionChange {
    if locked.subscription.status.is_terminal() {
        return SubscriptionChange::skip(SkipReason::Terminal);
    }
    let mut t = Transition::new(locked, ctx);
    t.change_status(SubscriptionStatus::Canceled);
    t.finish()
}

/// Builds the attempt row for a notification. Kept here so every producer numbers them alike.
pub(crate) fn new_attempt(
    sub: &Subscription,
    failure_id: Uuid,
    attempt_number: i32,
    kind: NotificationKind,
    now: NaiveDateTime,
) -> DunningAttempt {
    DunningAttempt {
        id: Uuid::new_v4(),
        payment_failure_id: failure_id,
        subscription_id: sub.id,
        user_id: sub.user_id,
        attempt_number,
        kind,
        sent: false,
        sent_at: None,
        created_at: now,
    }
}
