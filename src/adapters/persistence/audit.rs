use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

use crate::{
    adapters::persistence::PostgresPersistence,
    app_error::{AppError, AppResult},
    application::use_cases::audit::AuditRepoTrait,
    domain::entities::audit::{Actor, AuditEntry},
};

fn row_to_entry(row: sqlx::postgres::PgRow) -> AuditEntry {
    AuditEntry {
        id: row.get("id"),
        actor: Actor::from_db_string(row.get("actor")),
        action: row.get("action"),
        entity_type: row.get("entity_type"),
        entity_id: row.get("entity_id"),
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl AuditRepoTrait for PostgresPersistence {
    async fn list_by_entity(&self, entity_id: Uuid, limit: i64) -> AppResult<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, actor, action, entity_type, entity_id, metadata, created_at
            FROM billing_audit_log
            WHERE entity_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(entity_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(AppError::from)?;

        Ok(rows.into_iter().map(row_to_entry).collect())
    }
}
