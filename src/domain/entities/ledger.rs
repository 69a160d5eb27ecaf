use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Stored processing state of an inbound event.
///
/// Duplicates never get a row of their own; they bump `duplicate_count` on the original.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[derive(Default)]
pub enum LedgerOutcome {
    #[default]
    Pending,
    Accepted,
    Failed,
}

/// Result of the atomic check-and-insert on an event id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveResult {
    FirstSeen,
    AlreadySeen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub event_id: String,
    pub event_type: String,
    pub provider: String,
    pub payload: String,
    pub outcome: LedgerOutcome,
    pub last_error: Option<String>,
    pub duplicate_count: i32,
    pub replay_allowed: bool,
    pub received_at: NaiveDateTime,
    pub processed_at: Option<NaiveDateTime>,
}
