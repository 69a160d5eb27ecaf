use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::Row;

use crate::{
    adapters::persistence::{PostgresPersistence, parse_text_with_fallback},
    app_error::{AppError, AppResult},
    application::use_cases::ledger::{LedgerRepoTrait, NewInboundEvent},
    domain::entities::ledger::{LedgerEntry, LedgerOutcome, ReserveResult},
};

fn row_to_entry(row: sqlx::postgres::PgRow) -> LedgerEntry {
    let event_id: String = row.get("event_id");
    LedgerEntry {
        outcome: parse_text_with_fallback(row.get("outcome"), "outcome", "inbound_event", &event_id),
        event_id,
        event_type: row.get("event_type"),
        provider: row.get("provider"),
        payload: row.get("payload"),
        last_error: row.get("last_error"),
        duplicate_count: row.get("duplicate_count"),
        replay_allowed: row.get("replay_allowed"),
        received_at: row.get("received_at"),
        processed_at: row.get("processed_at"),
    }
}

const SELECT_COLS: &str = r#"
    event_id, event_type, provider, payload, outcome, last_error,
    duplicate_count, replay_allowed, received_at, processed_at
"#;

#[async_trait]
impl LedgerRepoTrait for PostgresPersistence {
    async fn check_and_reserve(
        &self,
        event: &NewInboundEvent<'_>,
        now: NaiveDateTime,
    ) -> AppResult<ReserveResult> {
        // The conflict branch only fires for rows an operator released for replay, so a
        // returned row always means this caller owns the event.
        let reserved = sqlx::query(
            r#"
            INSERT INTO inbound_event_ledger (event_id, event_type, provider, payload, outcome, received_at)
            VALUES ($1, $2, $3, $4, 'pending', $5)
            ON CONFLICT (event_id) DO UPDATE
                SET outcome = 'pending',
                    replay_allowed = FALSE,
                    last_error = NULL,
                    processed_at = NULL
                WHERE inbound_event_ledger.replay_allowed
            RETURNING event_id
            "#,
        )
        .bind(event.event_id)
        .bind(event.event_type)
        .bind(event.provider)
        .bind(event.payload)
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .map_err(AppError::from)?;

        if reserved.is_some() {
            return Ok(ReserveResult::FirstSeen);
        }

        sqlx::query(
            "UPDATE inbound_event_ledger SET duplicate_count = duplicate_count + 1 WHERE event_id = $1",
        )
        .bind(event.event_id)
        .execute(self.pool())
        .await
        .map_err(AppError::from)?;

        Ok(ReserveResult::AlreadySeen)
    }

    async fn record_outcome(
        &self,
        event_id: &str,
        outcome: LedgerOutcome,
        error: Option<&str>,
        now: NaiveDateTime,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE inbound_event_ledger
            SET outcome = $2, last_error = $3, processed_at = $4
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(outcome.as_ref())
        .bind(error)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(())
    }

    async fn reset_for_replay(&self, event_id: &str) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE inbound_event_ledger SET replay_allowed = TRUE WHERE event_id = $1",
        )
        .bind(event_id)
        .execute(self.pool())
        .await
        .map_err(AppError::from)?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, event_id: &str) -> AppResult<Option<LedgerEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM inbound_event_ledger WHERE event_id = $1",
            SELECT_COLS
        ))
        .bind(event_id)
        .fetch_optional(self.pool())
        .await
        .map_err(AppError::from)?;

        Ok(row.map(row_to_entry))
    }
}
