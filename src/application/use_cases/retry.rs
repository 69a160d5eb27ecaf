use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult, ProcessingError},
    application::{
        use_cases::{
            ledger::LedgerRepoTrait,
            reconcile::{IngestOutcome, ReconcileUseCases},
        },
        validators::{is_valid_operator, is_valid_operator_note},
    },
    domain::entities::{
        billing_event::BillingEvent,
        ledger::{LedgerEntry, LedgerOutcome},
        retry::{DeadLetterItem, RetryQueueItem, RetryQueueStats},
    },
};

pub const DEFAULT_DEAD_LETTER_LIMIT: i64 = 100;
pub const MAX_DEAD_LETTER_LIMIT: i64 = 500;

/// Upper bound on the jitter ratio. Below 1/3 an uncapped schedule keeps strictly growing gaps.
const MAX_JITTER: f64 = 0.33;

/// Longest exponent before the cap takes over for any sane base.
const MAX_EXPONENT: i32 = 30;

// ============================================================================
// Backoff
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: f64,
    pub max_retries: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::seconds(30),
            cap: Duration::seconds(3600),
            jitter: 0.2,
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^n, cap) * (1 + sample * jitter)` with `sample` in `[-1, 1]`.
    pub fn delay_with_sample(&self, retry_count: i32, sample: f64) -> Duration {
        let exponent = retry_count.clamp(0, MAX_EXPONENT);
        let base_ms = self.base.num_milliseconds() as f64;
        let cap_ms = self.cap.num_milliseconds() as f64;
        let raw = (base_ms * 2f64.powi(exponent)).min(cap_ms);

        let jitter = self.jitter.clamp(0.0, MAX_JITTER);
        let factor = 1.0 + sample.clamp(-1.0, 1.0) * jitter;
        Duration::milliseconds((raw * factor).round() as i64)
    }

    pub fn delay(&self, retry_count: i32) -> Duration {
        let sample = rand::random::<f64>() * 2.0 - 1.0;
        self.delay_with_sample(retry_count, sample)
    }
}

// ============================================================================
// Repository Traits
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct NewRetryItem<'a> {
    pub event_id: &'a str,
    pub event_type: &'a str,
    pub payload: &'a str,
    pub max_retries: i32,
    pub next_retry_at: NaiveDateTime,
    pub last_error: &'a str,
}

#[async_trait]
pub trait RetryQueueRepoTrait: Send + Sync {
    /// Queues a failed event. Returns false if the event is already queued.
    async fn enqueue(&self, item: &NewRetryItem<'_>, now: NaiveDateTime) -> AppResult<bool>;

    /// Claims due items whose lease is free or expired, setting `claimed_until = lease_until`.
    /// Concurrent callers never receive the same item.
    async fn claim_due(
        &self,
        now: NaiveDateTime,
        lease_until: NaiveDateTime,
        limit: i64,
    ) -> AppResult<Vec<RetryQueueItem>>;

    // The settle operations below only act while `claimed_until` still equals `lease`, the
    // value returned by `claim_due`. They return false once another worker has re-claimed
    // the item.

    /// Records a failed attempt and releases the claim.
    async fn reschedule(
        &self,
        id: Uuid,
        lease: NaiveDateTime,
        retry_count: i32,
        next_retry_at: NaiveDateTime,
        last_error: &str,
        now: NaiveDateTime,
    ) -> AppResult<bool>;

    /// Deletes an item after successful processing.
    async fn complete(&self, id: Uuid, lease: NaiveDateTime) -> AppResult<bool>;

    /// Deletes the queue item and inserts its dead letter in one transaction.
    async fn move_to_dead_letter(
        &self,
        id: Uuid,
        lease: NaiveDateTime,
        dead_letter: &DeadLetterItem,
    ) -> AppResult<bool>;

    async fn insert_dead_letter(&self, item: &DeadLetterItem) -> AppResult<()>;

    /// Newest first.
    async fn list_dead_letters(&self, limit: i64) -> AppResult<Vec<DeadLetterItem>>;

    async fn get_dead_letter(&self, id: Uuid) -> AppResult<Option<DeadLetterItem>>;

    async fn annotate_dead_letter(
        &self,
        id: Uuid,
        note: &str,
        operator: &str,
        now: NaiveDateTime,
    ) -> AppResult<Option<DeadLetterItem>>;

    async fn mark_dead_letter_replayed(&self, id: Uuid, now: NaiveDateTime) -> AppResult<()>;

    async fn stats(&self, now: NaiveDateTime) -> AppResult<RetryQueueStats>;

    async fn get_by_event(&self, event_id: &str) -> AppResult<Option<RetryQueueItem>>;
}

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub claimed: usize,
    pub succeeded: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    /// Items left alone because their claim ran out or passed to another worker.
    pub lease_lost: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayResult {
    pub dead_letter_id: Uuid,
    pub event_id: String,
    pub outcome: IngestOutcome,
}

/// Where an inbound event stands: its ledger entry and any pending retry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventStatus {
    pub ledger: LedgerEntry,
    pub retry: Option<RetryQueueItem>,
}

enum RetryOutcome {
    Succeeded,
    Rescheduled,
    DeadLettered,
    LeaseLost,
}

// ============================================================================
// Use Cases
// ============================================================================

pub struct RetryUseCases {
    queue: Arc<dyn RetryQueueRepoTrait>,
    ledger: Arc<dyn LedgerRepoTrait>,
    reconcile: Arc<ReconcileUseCases>,
    policy: RetryPolicy,
    batch_size: i64,
    claim_lease: Duration,
}

impl RetryUseCases {
    pub fn new(
        queue: Arc<dyn RetryQueueRepoTrait>,
        ledger: Arc<dyn LedgerRepoTrait>,
        reconcile: Arc<ReconcileUseCases>,
        policy: RetryPolicy,
        batch_size: i64,
        claim_lease: Duration,
    ) -> Self {
        Self {
            queue,
            ledger,
            reconcile,
            policy,
            batch_size,
            claim_lease,
        }
    }

    /// One pass of the retry worker over the due items.
    ///
    /// Items are re-run through the router under their original event id without touching
    /// the ledger reservation. A failure on a single item is logged and leaves its lease to
    /// expire, so the item is picked up again by a later sweep.
    pub async fn sweep(&self, now: NaiveDateTime) -> AppResult<SweepSummary> {
        let items = self
            .queue
            .claim_due(now, now + self.claim_lease, self.batch_size)
            .await?;

        let mut summary = SweepSummary {
            claimed: items.len(),
            ..Default::default()
        };

        let started = Instant::now();
        for item in &items {
            let Some(lease) = item
                .claimed_until
                .filter(|lease| self.lease_covers_run(*lease, now, started.elapsed()))
            else {
                warn!(item_id = %item.id, event_id = %item.event_id, "Claim too close to expiry, leaving item for a later sweep");
                summary.lease_lost += 1;
                continue;
            };

            match self.retry_one(item, lease, now).await {
                Ok(RetryOutcome::Succeeded) => summary.succeeded += 1,
                Ok(RetryOutcome::Rescheduled) => summary.rescheduled += 1,
                Ok(RetryOutcome::DeadLettered) => summary.dead_lettered += 1,
                Ok(RetryOutcome::LeaseLost) => summary.lease_lost += 1,
                Err(e) => {
                    error!(item_id = %item.id, event_id = %item.event_id, error = %e, "Failed to settle retry item");
                }
            }
        }

        if summary.claimed > 0 {
            info!(
                claimed = summary.claimed,
                succeeded = summary.succeeded,
                rescheduled = summary.rescheduled,
                dead_lettered = summary.dead_lettered,
                lease_lost = summary.lease_lost,
                "Retry sweep finished"
            );
        }
        Ok(summary)
    }

    /// Whether a processing run started `elapsed` into the sweep ends before `lease` does.
    fn lease_covers_run(&self, lease: NaiveDateTime, now: NaiveDateTime, elapsed: StdDuration) -> bool {
        let budget = elapsed + self.reconcile.processing_timeout();
        match Duration::from_std(budget) {
            Ok(budget) => now + budget < lease,
            Err(_) => false,
        }
    }

    async fn retry_one(
        &self,
        item: &RetryQueueItem,
        lease: NaiveDateTime,
        now: NaiveDateTime,
    ) -> AppResult<RetryOutcome> {
        let result = match BillingEvent::parse(&item.payload) {
            Ok(event) => self.reconcile.apply_event(&event, now).await,
            Err(e) => Err(ProcessingError::Permanent(format!("stored payload no longer parses: {e}"))),
        };

        match result {
            Ok(processed) => {
                let settled = self.queue.complete(item.id, lease).await;
                // The change is committed either way, so its notices go out regardless.
                self.reconcile.send_notices(&processed, now).await;
                if !settled? {
                    warn!(event_id = %item.event_id, "Retry claim taken over before completion");
                    return Ok(RetryOutcome::LeaseLost);
                }
                self.ledger
                    .record_outcome(&item.event_id, LedgerOutcome::Accepted, None, now)
                    .await?;
                info!(event_id = %item.event_id, retry_count = item.retry_count, "Retried event processed");
                Ok(RetryOutcome::Succeeded)
            }
            Err(ProcessingError::Transient(msg)) => {
                let retry_count = item.retry_count + 1;
                if retry_count >= item.max_retries {
                    let mut exhausted = item.clone();
                    exhausted.retry_count = retry_count;
                    let reason = format!("retries exhausted: {msg}");
                    return self.dead_letter(&exhausted, lease, &reason, now).await;
                }

                let next_retry_at = now + self.policy.delay(retry_count);
                if !self
                    .queue
                    .reschedule(item.id, lease, retry_count, next_retry_at, &msg, now)
                    .await?
                {
                    warn!(event_id = %item.event_id, "Retry claim taken over before reschedule");
                    return Ok(RetryOutcome::LeaseLost);
                }
                warn!(
                    event_id = %item.event_id,
                    retry_count,
                    next_retry_at = %next_retry_at,
                    error = %msg,
                    "Retry failed, rescheduled"
                );
                Ok(RetryOutcome::Rescheduled)
            }
            Err(ProcessingError::Permanent(msg)) => self.dead_letter(item, lease, &msg, now).await,
        }
    }

    async fn dead_letter(
        &self,
        item: &RetryQueueItem,
        lease: NaiveDateTime,
        reason: &str,
        now: NaiveDateTime,
    ) -> AppResult<RetryOutcome> {
        let dead_letter = DeadLetterItem::from_retry(item, reason, now);
        if !self.queue.move_to_dead_letter(item.id, lease, &dead_letter).await? {
            warn!(event_id = %item.event_id, "Retry claim taken over before dead-lettering");
            return Ok(RetryOutcome::LeaseLost);
        }
        self.ledger
            .record_outcome(&item.event_id, LedgerOutcome::Failed, Some(reason), now)
            .await?;
        error!(
            event_id = %item.event_id,
            event_type = %item.event_type,
            retry_count = item.retry_count,
            dead_letter_id = %dead_letter.id,
            error = %reason,
            alert = true,
            "Event moved to dead letter"
        );
        Ok(RetryOutcome::DeadLettered)
    }

    /// Feeds a dead letter back through ingestion under its original event id.
    ///
    /// Without `reset_ledger` the ledger still holds the id, so the result is `Duplicate`.
    pub async fn replay_dead_letter(
        &self,
        id: Uuid,
        reset_ledger: bool,
        now: NaiveDateTime,
    ) -> AppResult<ReplayResult> {
        let item = self.queue.get_dead_letter(id).await?.ok_or(AppError::NotFound)?;

        if reset_ledger && !self.ledger.reset_for_replay(&item.event_id).await? {
            warn!(event_id = %item.event_id, "Replay requested for event missing from ledger");
        }

        let outcome = self.reconcile.ingest(&item.payload, now).await?;
        self.queue.mark_dead_letter_replayed(id, now).await?;

        info!(
            dead_letter_id = %id,
            event_id = %item.event_id,
            reset_ledger,
            outcome = outcome.as_str(),
            "Dead letter replayed"
        );
        Ok(ReplayResult {
            dead_letter_id: id,
            event_id: item.event_id,
            outcome,
        })
    }

    pub async fn annotate_dead_letter(
        &self,
        id: Uuid,
        note: &str,
        operator: &str,
        now: NaiveDateTime,
    ) -> AppResult<DeadLetterItem> {
        if !is_valid_operator_note(note) {
            return Err(AppError::InvalidInput("Note must be 1-2000 characters".into()));
        }
        if !is_valid_operator(operator) {
            return Err(AppError::InvalidInput("Invalid operator".into()));
        }

        self.queue
            .annotate_dead_letter(id, note.trim(), operator.trim(), now)
            .await?
            .ok_or(AppError::NotFound)
    }

    pub async fn list_dead_letters(&self, limit: Option<i64>) -> AppResult<Vec<DeadLetterItem>> {
        let limit = limit
            .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
            .clamp(1, MAX_DEAD_LETTER_LIMIT);
        self.queue.list_dead_letters(limit).await
    }

    pub async fn stats(&self, now: NaiveDateTime) -> AppResult<RetryQueueStats> {
        self.queue.stats(now).await
    }

    pub async fn event_status(&self, event_id: &str) -> AppResult<EventStatus> {
        let ledger = self.ledger.get(event_id).await?.ok_or(AppError::NotFound)?;
        let retry = self.queue.get_by_event(event_id).await?;
        Ok(EventStatus { ledger, retry })
    }
}
