use std::str::FromStr;

use sqlx::PgPool;

use crate::app_error::AppError;

/// Parse a text column into an enum, logging a warning on failure.
///
/// The CHECK constraints in the schema keep unknown values out, so a failure here means the
/// row was written by a newer build or by hand.
///
/// # Arguments
/// * `value` - Raw column value
/// * `field_name` - Name of the column being parsed (for logging)
/// * `entity_type` - Type of entity (e.g., "subscription", "dunning_attempt")
/// * `entity_id` - ID of the entity (for log filtering)
pub fn parse_text_with_fallback<T: FromStr + Default>(
    value: &str,
    field_name: &str,
    entity_type: &str,
    entity_id: &str,
) -> T {
    value.parse().unwrap_or_else(|_| {
        tracing::warn!(
            field = field_name,
            entity_type = entity_type,
            entity_id = entity_id,
            raw_value = %value,
            "Failed to parse text column, using default value"
        );
        T::default()
    })
}

pub mod audit;
pub mod ledger;
pub mod retry_queue;
pub mod subscription;

#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    pub fn new(pool: PgPool) -> Self {
        PostgresPersistence { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => AppError::NotFound,
            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();
                // PostgreSQL unique violation
                if msg.contains("duplicate key") || msg.contains("unique constraint") {
                    AppError::Conflict("A record with this value already exists".into())
                }
                // PostgreSQL foreign key violation
                else if msg.contains("foreign key") || msg.contains("violates foreign key") {
                    AppError::InvalidInput("Referenced record not found".into())
                }
                // PostgreSQL not-null violation
                else if msg.contains("null value") && msg.contains("violates not-null") {
                    AppError::InvalidInput("Required field is missing".into())
                }
                // PostgreSQL check violation
                else if msg.contains("violates check constraint") {
                    AppError::InvalidInput("Value not allowed".into())
                } else {
                    // Log the actual error for debugging, but don't expose details
                    tracing::error!(error = ?err, "Database error");
                    AppError::Database("Database operation failed".into())
                }
            }
            _ => {
                tracing::error!(error = ?err, "Database error");
                AppError::Database("Database operation failed".into())
            }
        }
    }
}
