use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::{
    adapters::persistence::PostgresPersistence,
    app_error::{AppError, AppResult},
    application::use_cases::retry::{NewRetryItem, RetryQueueRepoTrait},
    domain::entities::retry::{DeadLetterItem, RetryQueueItem, RetryQueueStats},
};

fn row_to_item(row: sqlx::postgres::PgRow) -> RetryQueueItem {
    RetryQueueItem {
        id: row.get("id"),
        event_id: row.get("event_id"),
        event_type: row.get("event_type"),
        payload: row.get("payload"),
        retry_count: row.get("retry_count"),
        max_retries: row.get("max_retries"),
        next_retry_at: row.get("next_retry_at"),
        last_error: row.get("last_error"),
        claimed_until: row.get("claimed_until"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_dead_letter(row: sqlx::postgres::PgRow) -> DeadLetterItem {
    DeadLetterItem {
        id: row.get("id"),
        event_id: row.get("event_id"),
        event_type: row.get("event_type"),
        payload: row.get("payload"),
        retry_count: row.get("retry_count"),
        last_error: row.get("last_error"),
        failed_at: row.get("failed_at"),
        operator_note: row.get("operator_note"),
        annotated_by: row.get("annotated_by"),
        annotated_at: row.get("annotated_at"),
        replayed_at: row.get("replayed_at"),
        replay_count: row.get("replay_count"),
    }
}

const QUEUE_COLS: &str = r#"
    id, event_id, event_type, payload, retry_count, max_retries,
    next_retry_at, last_error, claimed_until, created_at, updated_at
"#;

const DEAD_LETTER_COLS: &str = r#"
    id, event_id, event_type, payload, retry_count, last_error, failed_at,
    operator_note, annotated_by, annotated_at, replayed_at, replay_count
"#;

async fn insert_dead_letter_row(conn: &mut PgConnection, item: &DeadLetterItem) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO webhook_dead_letter (
            id, event_id, event_type, payload, retry_count, last_error, failed_at,
            operator_note, annotated_by, annotated_at, replayed_at, replay_count
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(item.id)
    .bind(&item.event_id)
    .bind(&item.event_type)
    .bind(&item.payload)
    .bind(item.retry_count)
    .bind(&item.last_error)
    .bind(item.failed_at)
    .bind(&item.operator_note)
    .bind(&item.annotated_by)
    .bind(item.annotated_at)
    .bind(item.replayed_at)
    .bind(item.replay_count)
    .execute(&mut *conn)
    .await
    .map_err(AppError::from)?;
    Ok(())
}

#[async_trait]
impl RetryQueueRepoTrait for PostgresPersistence {
    async fn enqueue(&self, item: &NewRetryItem<'_>, now: NaiveDateTime) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO webhook_retry_queue (
                id, event_id, event_type, payload, retry_count, max_retries,
                next_retry_at, last_error, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, 0, $5, $6, $7, $8, $8)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(item.event_id)
        .bind(item.event_type)
        .bind(item.payload)
        .bind(item.max_retries)
        .bind(item.next_retry_at)
        .bind(item.last_error)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(AppError::from)?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim_due(
        &self,
        now: NaiveDateTime,
        lease_until: NaiveDateTime,
        limit: i64,
    ) -> AppResult<Vec<RetryQueueItem>> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE webhook_retry_queue
            SET claimed_until = $2
            WHERE id IN (
                SELECT id FROM webhook_retry_queue
                WHERE next_retry_at <= $1
                  AND (claimed_until IS NULL OR claimed_until < $1)
                ORDER BY next_retry_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            QUEUE_COLS
        ))
        .bind(now)
        .bind(lease_until)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(AppError::from)?;

        let mut items: Vec<RetryQueueItem> = rows.into_iter().map(row_to_item).collect();
        items.sort_by_key(|i| i.next_retry_at);
        Ok(items)
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
        let result = sqlx::query(
            r#"
            UPDATE webhook_retry_queue
            SET retry_count = $3,
                next_retry_at = $4,
                last_error = $5,
                claimed_until = NULL,
                updated_at = $6
            WHERE id = $1 AND claimed_until = $2
            "#,
        )
        .bind(id)
        .bind(lease)
        .bind(retry_count)
        .bind(next_retry_at)
        .bind(last_error)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete(&self, id: Uuid, lease: NaiveDateTime) -> AppResult<bool> {
        let result =
            sqlx::query("DELETE FROM webhook_retry_queue WHERE id = $1 AND claimed_until = $2")
                .bind(id)
                .bind(lease)
                .execute(self.pool())
                .await
                .map_err(AppError::from)?;
        Ok(result.rows_affected() == 1)
    }

    async fn move_to_dead_letter(
        &self,
        id: Uuid,
        lease: NaiveDateTime,
        dead_letter: &DeadLetterItem,
    ) -> AppResult<bool> {
        let mut tx = self.pool().begin().await.map_err(AppError::from)?;

        let deleted =
            sqlx::query("DELETE FROM webhook_retry_queue WHERE id = $1 AND claimed_until = $2")
                .bind(id)
                .bind(lease)
                .execute(&mut *tx)
                .await
                .map_err(AppError::from)?;
        if deleted.rows_affected() == 0 {
            tx.rollback().await.map_err(AppError::from)?;
            return Ok(false);
        }
        insert_dead_letter_row(&mut tx, dead_letter).await?;

        tx.commit().await.map_err(AppError::from)?;
        Ok(true)
    }

    async fn insert_dead_letter(&self, item: &DeadLetterItem) -> AppResult<()> {
        let mut conn = self.pool().acquire().await.map_err(AppError::from)?;
        insert_dead_letter_row(&mut conn, item).await
    }

    async fn list_dead_letters(&self, limit: i64) -> AppResult<Vec<DeadLetterItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM webhook_dead_letter ORDER BY failed_at DESC LIMIT $1",
            DEAD_LETTER_COLS
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(AppError::from)?;

        Ok(rows.into_iter().map(row_to_dead_letter).collect())
    }

    async fn get_dead_letter(&self, id: Uuid) -> AppResult<Option<DeadLetterItem>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM webhook_dead_letter WHERE id = $1",
            DEAD_LETTER_COLS
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(AppError::from)?;

        Ok(row.map(row_to_dead_letter))
    }

    async fn annotate_dead_letter(
        &self,
        id: Uuid,
        note: &str,
        operator: &str,
        now: NaiveDateTime,
    ) -> AppResult<Option<DeadLetterItem>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE webhook_dead_letter
            SET operator_note = $2, annotated_by = $3, annotated_at = $4
            WHERE id = $1
            RETURNING {}
            "#,
            DEAD_LETTER_COLS
        ))
        .bind(id)
        .bind(note)
        .bind(operator)
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .map_err(AppError::from)?;

        Ok(row.map(row_to_dead_letter))
    }

    async fn mark_dead_letter_replayed(&self, id: Uuid, now: NaiveDateTime) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_dead_letter
            SET replayed_at = $2, replay_count = replay_count + 1
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(())
    }

    async fn stats(&self, now: NaiveDateTime) -> AppResult<RetryQueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM webhook_retry_queue) AS pending,
                (SELECT COUNT(*) FROM webhook_retry_queue WHERE next_retry_at <= $1) AS due,
                (SELECT COUNT(*) FROM webhook_dead_letter) AS dead_letters
            "#,
        )
        .bind(now)
        .fetch_one(self.pool())
        .await
        .map_err(AppError::from)?;

        Ok(RetryQueueStats {
            pending: row.get("pending"),
            due: row.get("due"),
            dead_letters: row.get("dead_letters"),
        })
    }

    async fn get_by_event(&self, event_id: &str) -> AppResult<Option<RetryQueueItem>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM webhook_retry_queue WHERE event_id = $1",
            QUEUE_COLS
        ))
        .bind(event_id)
        .fetch_optional(self.pool())
        .await
        .map_err(AppError::from)?;

        Ok(row.map(row_to_item))
    }
}
