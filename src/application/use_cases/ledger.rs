use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::{
    app_error::AppResult,
    domain::entities::ledger::{LedgerEntry, LedgerOutcome, ReserveResult},
};

#[derive(Debug, Clone, Copy)]
pub struct NewInboundEvent<'a> {
    pub event_id: &'a str,
    pub event_type: &'a str,
    pub provider: &'a str,
    pub payload: &'a str,
}

/// Durable record of every provider event id ever accepted.
#[async_trait]
pub trait LedgerRepoTrait: Send + Sync {
    /// Atomic check-and-insert keyed on the event id.
    ///
    /// Returns `FirstSeen` exactly once per id, unless an operator reset the row for replay,
    /// in which case the next call consumes the reset and returns `FirstSeen` again.
    async fn check_and_reserve(
        &self,
        event: &NewInboundEvent<'_>,
        now: NaiveDateTime,
    ) -> AppResult<ReserveResult>;

    async fn record_outcome(
        &self,
        event_id: &str,
        outcome: LedgerOutcome,
        error: Option<&str>,
        now: NaiveDateTime,
    ) -> AppResult<()>;

    /// Allows the event to be processed once more. Returns false if the id is unknown.
    async fn reset_for_replay(&self, event_id: &str) -> AppResult<bool>;

    async fn get(&self, event_id: &str) -> AppResult<Option<LedgerEntry>>;
}
