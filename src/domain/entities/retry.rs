use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A processing failure waiting for another attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryQueueItem {
    pub id: Uuid,
    pub event_id: String,
    pub event_type: String,
    pub payload: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: NaiveDateTime,
    pub last_error: Option<String>,
    /// Lease held by the worker that claimed this item. Expired leases are claimable again.
    pub claimed_until: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Terminal quarantine record. Only operator fields change after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterItem {
    pub id: Uuid,
    pub event_id: String,
    pub event_type: String,
    pub payload: String,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub failed_at: NaiveDateTime,
    pub operator_note: Option<String>,
    pub annotated_by: Option<String>,
    pub annotated_at: Option<NaiveDateTime>,
    pub replayed_at: Option<NaiveDateTime>,
    pub replay_count: i32,
}

impl DeadLetterItem {
    pub fn new(
        event_id: &str,
        event_type: &str,
        payload: &str,
        retry_count: i32,
        last_error: &str,
        failed_at: NaiveDateTime,
    ) -> Self {
        DeadLetterItem {
            id: Uuid::new_v4(),
            event_id: event_id.to_string(),
            event_type: event_type.to_string(),
            payload: payload.to_string(),
            retry_count,
            last_error: Some(last_error.to_string()),
            failed_at,
            operator_note: None,
            annotated_by: None,
            annotated_at: None,
            replayed_at: None,
            replay_count: 0,
        }
    }

    pub fn from_retry(item: &RetryQueueItem, last_error: &str, failed_at: NaiveDateTime) -> Self {
        Self::new(
            &item.event_id,
            &item.event_type,
            &item.payload,
            item.retry_count,
            last_error,
            failed_at,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RetryQueueStats {
    pub pending: i64,
    pub due: i64,
    pub dead_letters: i64,
}
