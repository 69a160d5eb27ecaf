use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult},
    application::{
        ports::entitlement::EntitlementReader,
        use_cases::audit::{AuditRepoTrait, DEFAULT_AUDIT_LIMIT, MAX_AUDIT_LIMIT},
        validators::is_valid_provider_id,
    },
    domain::{
        entities::{
            audit::{Actor, AuditEntry, actions},
            payment_failure::{DunningAttempt, PaymentFailure},
            subscription::{Subscription, SubscriptionStatus, Tier},
        },
        policy::BillingPolicy,
        state_machine::{
            ENTITY_SUBSCRIPTION, LockedSubscription, SkipReason, SubscriptionChange,
            TransitionContext, on_user_cancel,
        },
    },
};

// ============================================================================
// Repository Traits
// ============================================================================

/// How a transition finds the row it must lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionLocator {
    Id(Uuid),
    /// Provider subscription id. Falls back to the customer's open checkout that has not
    /// been linked to a provider subscription yet.
    Provider {
        subscription_id: String,
        customer_id: Option<String>,
    },
    /// The user's newest non-canceled subscription, else their newest one.
    CurrentForUser(Uuid),
}

/// Pure decision run while the row lock is held.
pub type Decide<'a> = &'a (dyn Fn(&LockedSubscription) -> SubscriptionChange + Send + Sync);

#[async_trait]
pub trait SubscriptionRepoTrait: Send + Sync {
    /// Inserts a new subscription and its audit entry in one transaction. A second
    /// non-canceled row for the same user is a `Conflict`.
    async fn create(&self, subscription: &Subscription, audit: &AuditEntry)
    -> AppResult<Subscription>;

    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<Subscription>>;

    async fn find_current_for_user(&self, user_id: Uuid) -> AppResult<Option<Subscription>>;

    /// Single writer for subscription state.
    ///
    /// Locks the located row, loads its open failures and their dunning history, runs
    /// `decide`, and writes the resulting change in the same transaction. Returns `None`
    /// when no row matches.
    async fn apply_locked(
        &self,
        locator: &SubscriptionLocator,
        decide: Decide<'_>,
    ) -> AppResult<Option<SubscriptionChange>>;

    /// `past_due` subscriptions whose grace period ended at or before `now`.
    async fn list_grace_expired(&self, now: NaiveDateTime, limit: i64) -> AppResult<Vec<Uuid>>;

    /// `past_due` subscriptions whose grace period ends in `(now, window_end]`.
    async fn list_grace_ending(
        &self,
        now: NaiveDateTime,
        window_end: NaiveDateTime,
        limit: i64,
    ) -> AppResult<Vec<Uuid>>;

    async fn mark_attempt_sent(&self, attempt_id: Uuid, sent_at: NaiveDateTime) -> AppResult<()>;

    /// Every failure of the subscription, resolved or not, oldest first.
    async fn list_failures(&self, subscription_id: Uuid) -> AppResult<Vec<PaymentFailure>>;

    /// Newest first.
    async fn list_attempts_for_user(&self, user_id: Uuid, limit: i64) -> AppResult<Vec<DunningAttempt>>;
}

pub const DEFAULT_ATTEMPT_LIMIT: i64 = 50;
pub const MAX_ATTEMPT_LIMIT: i64 = 500;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entitlement {
    pub user_id: Uuid,
    pub entitled: bool,
    pub status: Option<SubscriptionStatus>,
    pub tier: Tier,
    pub grace_period_end: Option<NaiveDateTime>,
}

// ============================================================================
// Use Cases
// ============================================================================

#[derive(Clone)]
pub struct SubscriptionUseCases {
    repo: Arc<dyn SubscriptionRepoTrait>,
    audit_repo: Arc<dyn AuditRepoTrait>,
    policy: BillingPolicy,
}

impl SubscriptionUseCases {
    pub fn new(
        repo: Arc<dyn SubscriptionRepoTrait>,
        audit_repo: Arc<dyn AuditRepoTrait>,
        policy: BillingPolicy,
    ) -> Self {
        Self {
            repo,
            audit_repo,
            policy,
        }
    }

    /// Opens an `incomplete` subscription at checkout. A user whose previous subscription was
    /// canceled starts a new lifecycle here.
    pub async fn open_checkout(
        &self,
        user_id: Uuid,
        provider_customer_id: &str,
        now: NaiveDateTime,
    ) -> AppResult<Subscription> {
        let provider_customer_id = provider_customer_id.trim();
        if !is_valid_provider_id(provider_customer_id) {
            return Err(AppError::InvalidInput("Invalid provider customer id".into()));
        }

        if let Some(current) = self.repo.find_current_for_user(user_id).await?
            && !current.status.is_terminal()
        {
            return Err(AppError::Conflict(format!(
                "User already has a {} subscription",
                current.status
            )));
        }

        let subscription = Subscription::open_checkout(user_id, provider_customer_id, now);
        let audit = AuditEntry::new(
            Actor::User(user_id),
            actions::SUBSCRIPTION_CREATED,
            ENTITY_SUBSCRIPTION,
            subscription.id,
            json!({ "provider_customer_id": provider_customer_id }),
            now,
        );
        let created = self.repo.create(&subscription, &audit).await?;
        info!(subscription_id = %created.id, user_id = %user_id, "Opened checkout subscription");
        Ok(created)
    }

    /// Immediate cancel on behalf of the user, through the same locked path webhooks use.
    pub async fn cancel_immediately(
        &self,
        user_id: Uuid,
        now: NaiveDateTime,
    ) -> AppResult<Subscription> {
        let policy = &self.policy;
        let decide = move |locked: &LockedSubscription| {
            let ctx = TransitionContext {
                policy,
                actor: Actor::User(user_id),
                now,
                event_id: None,
            };
            on_user_cancel(locked, &ctx)
        };

        let change = self
            .repo
            .apply_locked(&SubscriptionLocator::CurrentForUser(user_id), &decide)
            .await?
            .ok_or(AppError::NotFound)?;

        if change.skipped == Some(SkipReason::Terminal) {
            return Err(AppError::Conflict("Subscription is already canceled".into()));
        }

        let canceled = change
            .subscription
            .ok_or_else(|| AppError::Internal("Cancel produced no subscription update".into()))?;
        info!(subscription_id = %canceled.id, user_id = %user_id, "Subscription canceled by user");
        Ok(canceled)
    }

    pub async fn entitlement(&self, user_id: Uuid, now: NaiveDateTime) -> AppResult<Entitlement> {
        let current = self.repo.find_current_for_user(user_id).await?;
        Ok(match current {
            Some(sub) => Entitlement {
                user_id,
                entitled: sub.is_entitled(now),
                status: Some(sub.status),
                tier: if sub.is_entitled(now) { sub.tier } else { Tier::Free },
                grace_period_end: sub.grace_period_end,
            },
            None => Entitlement {
                user_id,
                entitled: false,
                status: None,
                tier: Tier::Free,
                grace_period_end: None,
            },
        })
    }

    pub async fn get(&self, id: Uuid) -> AppResult<Subscription> {
        self.repo.get_by_id(id).await?.ok_or(AppError::NotFound)
    }

    /// Payment failure history of a subscription, for operators working a dunning case.
    pub async fn list_payment_failures(&self, subscription_id: Uuid) -> AppResult<Vec<PaymentFailure>> {
        let subscription = self.get(subscription_id).await?;
        self.repo.list_failures(subscription.id).await
    }

    /// Notices recorded for the user across all their subscriptions.
    pub async fn list_dunning_attempts(
        &self,
        user_id: Uuid,
        limit: Option<i64>,
    ) -> AppResult<Vec<DunningAttempt>> {
        let limit = limit.unwrap_or(DEFAULT_ATTEMPT_LIMIT).clamp(1, MAX_ATTEMPT_LIMIT);
        self.repo.list_attempts_for_user(user_id, limit).await
    }

    pub async fn list_audit(&self, entity_id: Uuid, limit: Option<i64>) -> AppResult<Vec<AuditEntry>> {
        let limit = limit.unwrap_or(DEFAULT_AUDIT_LIMIT).clamp(1, MAX_AUDIT_LIMIT);
        self.audit_repo.list_by_entity(entity_id, limit).await
    }
}

#[async_trait]
impl EntitlementReader for SubscriptionUseCases {
    async fn is_entitled(&self, user_id: Uuid) -> AppResult<bool> {
        let now = chrono::Utc::now().naive_utc();
        Ok(self.entitlement(user_id, now).await?.entitled)
    }
}
