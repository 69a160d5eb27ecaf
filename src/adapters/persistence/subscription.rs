use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::{PgConnection, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    adapters::persistence::{PostgresPersistence, parse_text_with_fallback},
    app_error::{AppError, AppResult},
    application::use_cases::subscription::{Decide, SubscriptionLocator, SubscriptionRepoTrait},
    domain::{
        entities::{
            audit::AuditEntry,
            payment_failure::{DunningAttempt, PaymentFailure},
            subscription::Subscription,
        },
        state_machine::{LockedSubscription, SubscriptionChange},
    },
};

const SUBSCRIPTION_COLS: &str = r#"
    id, user_id, provider_customer_id, provider_subscription_id, provider_price_id,
    status, tier, current_period_start, current_period_end, cancel_at_period_end,
    trial_start, trial_end, grace_period_end, canceled_at, last_event_at,
    created_at, updated_at
"#;

const FAILURE_COLS: &str = r#"
    id, subscription_id, provider_invoice_id, amount_due, attempt_count, failure_reason,
    next_retry_at, resolved, resolved_at, created_at, updated_at
"#;

const ATTEMPT_COLS: &str = r#"
    id, payment_failure_id, subscription_id, user_id, attempt_number, kind,
    sent, sent_at, created_at
"#;

fn row_to_subscription(row: sqlx::postgres::PgRow) -> Subscription {
    let id: Uuid = row.get("id");
    let entity_id = id.to_string();
    Subscription {
        id,
        user_id: row.get("user_id"),
        provider_customer_id: row.get("provider_customer_id"),
        provider_subscription_id: row.get("provider_subscription_id"),
        provider_price_id: row.get("provider_price_id"),
        status: parse_text_with_fallback(row.get("status"), "status", "subscription", &entity_id),
        tier: parse_text_with_fallback(row.get("tier"), "tier", "subscription", &entity_id),
        current_period_start: row.get("current_period_start"),
        current_period_end: row.get("current_period_end"),
        cancel_at_period_end: row.get("cancel_at_period_end"),
        trial_start: row.get("trial_start"),
        trial_end: row.get("trial_end"),
        grace_period_end: row.get("grace_period_end"),
        canceled_at: row.get("canceled_at"),
        last_event_at: row.get("last_event_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_failure(row: sqlx::postgres::PgRow) -> PaymentFailure {
    PaymentFailure {
        id: row.get("id"),
        subscription_id: row.get("subscription_id"),
        provider_invoice_id: row.get("provider_invoice_id"),
        amount_due: row.get("amount_due"),
        attempt_count: row.get("attempt_count"),
        failure_reason: row.get("failure_reason"),
        next_retry_at: row.get("next_retry_at"),
        resolved: row.get("resolved"),
        resolved_at: row.get("resolved_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_attempt(row: sqlx::postgres::PgRow) -> DunningAttempt {
    let id: Uuid = row.get("id");
    DunningAttempt {
        id,
        payment_failure_id: row.get("payment_failure_id"),
        subscription_id: row.get("subscription_id"),
        user_id: row.get("user_id"),
        attempt_number: row.get("attempt_number"),
        kind: parse_text_with_fallback(row.get("kind"), "kind", "dunning_attempt", &id.to_string()),
        sent: row.get("sent"),
        sent_at: row.get("sent_at"),
        created_at: row.get("created_at"),
    }
}

// ============================================================================
// Statements shared by the transactional paths
// ============================================================================

async fn lock_subscription(
    conn: &mut PgConnection,
    locator: &SubscriptionLocator,
) -> AppResult<Option<Subscription>> {
    let row = match locator {
        SubscriptionLocator::Id(id) => sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1 FOR UPDATE",
            SUBSCRIPTION_COLS
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(AppError::from)?,
        SubscriptionLocator::Provider {
            subscription_id,
            customer_id,
        } => lock_by_provider(&mut *conn, subscription_id, customer_id.as_deref()).await?,
        SubscriptionLocator::CurrentForUser(user_id) => sqlx::query(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE user_id = $1
            ORDER BY (status = 'canceled'), created_at DESC
            LIMIT 1
            FOR UPDATE
            "#,
            SUBSCRIPTION_COLS
        ))
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(AppError::from)?,
    };

    Ok(row.map(row_to_subscription))
}

/// The two row-locking reads behind a provider locator.
#[async_trait]
trait ProviderRowLookup: Send {
    type Row: Send;

    async fn linked(&mut self, subscription_id: &str) -> AppResult<Option<Self::Row>>;

    /// Newest open checkout for the customer that has no provider subscription yet.
    async fn unlinked_for_customer(&mut self, customer_id: &str) -> AppResult<Option<Self::Row>>;
}

#[async_trait]
impl ProviderRowLookup for PgConnection {
    type Row = PgRow;

    async fn linked(&mut self, subscription_id: &str) -> AppResult<Option<PgRow>> {
        sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE provider_subscription_id = $1 FOR UPDATE",
            SUBSCRIPTION_COLS
        ))
        .bind(subscription_id)
        .fetch_optional(&mut *self)
        .await
        .map_err(AppError::from)
    }

    async fn unlinked_for_customer(&mut self, customer_id: &str) -> AppResult<Option<PgRow>> {
        sqlx::query(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE provider_customer_id = $1
              AND provider_subscription_id IS NULL
              AND status <> 'canceled'
            ORDER BY created_at DESC
            LIMIT 1
            FOR UPDATE
            "#,
            SUBSCRIPTION_COLS
        ))
        .bind(customer_id)
        .fetch_optional(&mut *self)
        .await
        .map_err(AppError::from)
    }
}

/// Locks the subscription a provider event refers to. An open checkout is matched by customer
/// until its provider id is linked.
///
/// When the customer lookup waits on a row that a concurrent transaction is linking, the row no
/// longer matches `provider_subscription_id IS NULL` once that transaction commits and the
/// lookup comes back empty. The linked lookup then runs again as a new statement, which sees
/// the committed link.
async fn lock_by_provider<L: ProviderRowLookup>(
    lookup: &mut L,
    subscription_id: &str,
    customer_id: Option<&str>,
) -> AppResult<Option<L::Row>> {
    if let Some(row) = lookup.linked(subscription_id).await? {
        return Ok(Some(row));
    }
    let Some(customer_id) = customer_id else {
        return Ok(None);
    };
    if let Some(row) = lookup.unlinked_for_customer(customer_id).await? {
        return Ok(Some(row));
    }
    lookup.linked(subscription_id).await
}

async fn update_subscription(conn: &mut PgConnection, sub: &Subscription) -> AppResult<()> {
    sqlx::query(
        r#"
        UPDATE subscriptions
        SET provider_customer_id = $2,
            provider_subscription_id = $3,
            provider_price_id = $4,
            status = $5,
            tier = $6,
            current_period_start = $7,
            current_period_end = $8,
            cancel_at_period_end = $9,
            trial_start = $10,
            trial_end = $11,
            grace_period_end = $12,
            canceled_at = $13,
            last_event_at = $14,
            updated_at = $15
        WHERE id = $1
        "#,
    )
    .bind(sub.id)
    .bind(&sub.provider_customer_id)
    .bind(&sub.provider_subscription_id)
    .bind(&sub.provider_price_id)
    .bind(sub.status.as_ref())
    .bind(sub.tier.as_ref())
    .bind(sub.current_period_start)
    .bind(sub.current_period_end)
    .bind(sub.cancel_at_period_end)
    .bind(sub.trial_start)
    .bind(sub.trial_end)
    .bind(sub.grace_period_end)
    .bind(sub.canceled_at)
    .bind(sub.last_event_at)
    .bind(sub.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(AppError::from)?;
    Ok(())
}

async fn upsert_failure(conn: &mut PgConnection, failure: &PaymentFailure) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO payment_failures (
            id, subscription_id, provider_invoice_id, amount_due, attempt_count,
            failure_reason, next_retry_at, resolved, resolved_at, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (id) DO UPDATE SET
            provider_invoice_id = EXCLUDED.provider_invoice_id,
            amount_due = EXCLUDED.amount_due,
            attempt_count = EXCLUDED.attempt_count,
            failure_reason = EXCLUDED.failure_reason,
            next_retry_at = EXCLUDED.next_retry_at,
            resolved = EXCLUDED.resolved,
            resolved_at = EXCLUDED.resolved_at,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(failure.id)
    .bind(failure.subscription_id)
    .bind(&failure.provider_invoice_id)
    .bind(failure.amount_due)
    .bind(failure.attempt_count)
    .bind(&failure.failure_reason)
    .bind(failure.next_retry_at)
    .bind(failure.resolved)
    .bind(failure.resolved_at)
    .bind(failure.created_at)
    .bind(failure.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(AppError::from)?;
    Ok(())
}

async fn insert_attempt(conn: &mut PgConnection, attempt: &DunningAttempt) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO dunning_attempts (
            id, payment_failure_id, subscription_id, user_id, attempt_number, kind,
            sent, sent_at, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(attempt.id)
    .bind(attempt.payment_failure_id)
    .bind(attempt.subscription_id)
    .bind(attempt.user_id)
    .bind(attempt.attempt_number)
    .bind(attempt.kind.as_ref())
    .bind(attempt.sent)
    .bind(attempt.sent_at)
    .bind(attempt.created_at)
    .execute(&mut *conn)
    .await
    .map_err(AppError::from)?;
    Ok(())
}

pub(super) async fn insert_audit(conn: &mut PgConnection, entry: &AuditEntry) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO billing_audit_log (id, actor, action, entity_type, entity_id, metadata, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(entry.id)
    .bind(entry.actor.as_db_string())
    .bind(&entry.action)
    .bind(&entry.entity_type)
    .bind(entry.entity_id)
    .bind(&entry.metadata)
    .bind(entry.created_at)
    .execute(&mut *conn)
    .await
    .map_err(AppError::from)?;
    Ok(())
}

#[async_trait]
impl SubscriptionRepoTrait for PostgresPersistence {
    async fn create(
        &self,
        subscription: &Subscription,
        audit: &AuditEntry,
    ) -> AppResult<Subscription> {
        let mut tx = self.pool().begin().await.map_err(AppError::from)?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO subscriptions (
                id, user_id, provider_customer_id, provider_subscription_id, provider_price_id,
                status, tier, cancel_at_period_end, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {}
            "#,
            SUBSCRIPTION_COLS
        ))
        .bind(subscription.id)
        .bind(subscription.user_id)
        .bind(&subscription.provider_customer_id)
        .bind(&subscription.provider_subscription_id)
        .bind(&subscription.provider_price_id)
        .bind(subscription.status.as_ref())
        .bind(subscription.tier.as_ref())
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match AppError::from(e) {
            AppError::Conflict(_) => AppError::Conflict("User already has a live subscription".into()),
            other => other,
        })?;

        insert_audit(&mut tx, audit).await?;
        tx.commit().await.map_err(AppError::from)?;

        Ok(row_to_subscription(row))
    }

    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<Subscription>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLS
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(AppError::from)?;

        Ok(row.map(row_to_subscription))
    }

    async fn find_current_for_user(&self, user_id: Uuid) -> AppResult<Option<Subscription>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE user_id = $1
            ORDER BY (status = 'canceled'), created_at DESC
            LIMIT 1
            "#,
            SUBSCRIPTION_COLS
        ))
        .bind(user_id)
        .fetch_optional(self.pool())
        .await
        .map_err(AppError::from)?;

        Ok(row.map(row_to_subscription))
    }

    async fn apply_locked(
        &self,
        locator: &SubscriptionLocator,
        decide: Decide<'_>,
    ) -> AppResult<Option<SubscriptionChange>> {
        let mut tx = self.pool().begin().await.map_err(AppError::from)?;

        let Some(subscription) = lock_subscription(&mut tx, locator).await? else {
            return Ok(None);
        };

        let open_failures: Vec<PaymentFailure> = sqlx::query(&format!(
            r#"
            SELECT {} FROM payment_failures
            WHERE subscription_id = $1 AND NOT resolved
            ORDER BY created_at
            FOR UPDATE
            "#,
            FAILURE_COLS
        ))
        .bind(subscription.id)
        .fetch_all(&mut *tx)
        .await
        .map_err(AppError::from)?
        .into_iter()
        .map(row_to_failure)
        .collect();

        let failure_ids: Vec<Uuid> = open_failures.iter().map(|f| f.id).collect();
        let attempts: Vec<DunningAttempt> = sqlx::query(&format!(
            r#"
            SELECT {} FROM dunning_attempts
            WHERE payment_failure_id = ANY($1)
            ORDER BY created_at
            "#,
            ATTEMPT_COLS
        ))
        .bind(&failure_ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(AppError::from)?
        .into_iter()
        .map(row_to_attempt)
        .collect();

        let locked = LockedSubscription {
            subscription,
            open_failures,
            attempts,
        };
        let change = decide(&locked);

        if change.is_noop() {
            tx.rollback().await.map_err(AppError::from)?;
            return Ok(Some(change));
        }

        if let Some(updated) = &change.subscription {
            update_subscription(&mut tx, updated).await?;
        }
        for failure in &change.failures {
            upsert_failure(&mut tx, failure).await?;
        }
        for attempt in &change.attempts {
            insert_attempt(&mut tx, attempt).await?;
        }
        for entry in &change.audit {
            insert_audit(&mut tx, entry).await?;
        }

        tx.commit().await.map_err(AppError::from)?;
        Ok(Some(change))
    }

    async fn list_grace_expired(&self, now: NaiveDateTime, limit: i64) -> AppResult<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM subscriptions
            WHERE status = 'past_due' AND grace_period_end <= $1
            ORDER BY grace_period_end
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(AppError::from)?;

        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    async fn list_grace_ending(
        &self,
        now: NaiveDateTime,
        window_end: NaiveDateTime,
        limit: i64,
    ) -> AppResult<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM subscriptions
            WHERE status = 'past_due'
              AND grace_period_end > $1
              AND grace_period_end <= $2
            ORDER BY grace_period_end
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(window_end)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(AppError::from)?;

        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    async fn mark_attempt_sent(&self, attempt_id: Uuid, sent_at: NaiveDateTime) -> AppResult<()> {
        sqlx::query("UPDATE dunning_attempts SET sent = TRUE, sent_at = $2 WHERE id = $1")
            .bind(attempt_id)
            .bind(sent_at)
            .execute(self.pool())
            .await
            .map_err(AppError::from)?;
        Ok(())
    }

    async fn list_failures(&self, subscription_id: Uuid) -> AppResult<Vec<PaymentFailure>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM payment_failures WHERE subscription_id = $1 ORDER BY created_at",
            FAILURE_COLS
        ))
        .bind(subscription_id)
        .fetch_all(self.pool())
        .await
        .map_err(AppError::from)?;

        Ok(rows.into_iter().map(row_to_failure).collect())
    }

    async fn list_attempts_for_user(&self, user_id: Uuid, limit: i64) -> AppResult<Vec<DunningAttempt>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM dunning_attempts WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
            ATTEMPT_COLS
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(AppError::from)?;

        Ok(rows.into_iter().map(row_to_attempt).collect())
    }
}
