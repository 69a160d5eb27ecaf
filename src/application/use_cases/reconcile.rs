use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    app_error::{AppResult, ProcessingError},
    application::use_cases::{
        dunning::NotificationDispatcher,
        ledger::{LedgerRepoTrait, NewInboundEvent},
        retry::{NewRetryItem, RetryPolicy, RetryQueueRepoTrait},
        subscription::{Decide, SubscriptionLocator, SubscriptionRepoTrait},
    },
    domain::{
        entities::{
            audit::Actor,
            billing_event::{BillingEvent, BillingEventKind},
            ledger::{LedgerOutcome, ReserveResult},
            retry::DeadLetterItem,
        },
        policy::BillingPolicy,
        state_machine::{
            LockedSubscription, SubscriptionChange, TransitionContext, on_invoice_paid,
            on_invoice_payment_failed, on_payment_intent, on_subscription_event,
        },
    },
};

/// What happened to an inbound delivery. Every variant is answered `200`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    Accepted,
    Duplicate,
    Ignored,
    QueuedForRetry,
    DeadLettered,
}

impl IngestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestOutcome::Accepted => "accepted",
            IngestOutcome::Duplicate => "duplicate",
            IngestOutcome::Ignored => "ignored",
            IngestOutcome::QueuedForRetry => "queued_for_retry",
            IngestOutcome::DeadLettered => "dead_lettered",
        }
    }
}

/// Result of a handler that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteResult {
    /// The subscription was located and the transition ran (possibly as a no-op).
    Applied,
    /// The event refers to a subscription we do not track.
    UnknownSubscription,
    /// Event kind we do not handle.
    Ignored,
}

pub struct ReconcileUseCases {
    provider: String,
    ledger: Arc<dyn LedgerRepoTrait>,
    subscriptions: Arc<dyn SubscriptionRepoTrait>,
    retry_queue: Arc<dyn RetryQueueRepoTrait>,
    dispatcher: Arc<NotificationDispatcher>,
    policy: BillingPolicy,
    retry_policy: RetryPolicy,
    processing_timeout: Duration,
}

impl ReconcileUseCases {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: String,
        ledger: Arc<dyn LedgerRepoTrait>,
        subscriptions: Arc<dyn SubscriptionRepoTrait>,
        retry_queue: Arc<dyn RetryQueueRepoTrait>,
        dispatcher: Arc<NotificationDispatcher>,
        policy: BillingPolicy,
        retry_policy: RetryPolicy,
        processing_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            ledger,
            subscriptions,
            retry_queue,
            dispatcher,
            policy,
            retry_policy,
            processing_timeout,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Entry point for a delivery whose signature has already been verified.
    ///
    /// Malformed payloads fail with `InvalidInput` before anything is written. Processing
    /// failures never surface as errors: they are queued or dead-lettered and reported in the
    /// returned outcome.
    pub async fn ingest(&self, raw: &str, now: NaiveDateTime) -> AppResult<IngestOutcome> {
        let event = BillingEvent::parse(raw)?;
        self.ingest_event(&event, raw, now).await
    }

    pub async fn ingest_event(
        &self,
        event: &BillingEvent,
        raw: &str,
        now: NaiveDateTime,
    ) -> AppResult<IngestOutcome> {
        let reserve = self
            .ledger
            .check_and_reserve(
                &NewInboundEvent {
                    event_id: &event.id,
                    event_type: &event.event_type,
                    provider: &self.provider,
                    payload: raw,
                },
                now,
            )
            .await?;

        if reserve == ReserveResult::AlreadySeen {
            info!(event_id = %event.id, event_type = %event.event_type, "Duplicate event, skipping");
            return Ok(IngestOutcome::Duplicate);
        }

        match self.apply_event(event, now).await {
            Ok(processed) => {
                self.record(&event.id, LedgerOutcome::Accepted, None, now).await;
                self.send_notices(&processed, now).await;
                Ok(match processed.result {
                    RouteResult::Ignored => IngestOutcome::Ignored,
                    RouteResult::Applied | RouteResult::UnknownSubscription => {
                        IngestOutcome::Accepted
                    }
                })
            }
            Err(ProcessingError::Transient(msg)) => {
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %msg,
                    "Transient processing failure, queueing for retry"
                );
                let item = NewRetryItem {
                    event_id: &event.id,
                    event_type: &event.event_type,
                    payload: raw,
                    max_retries: self.retry_policy.max_retries,
                    next_retry_at: now + self.retry_policy.delay(0),
                    last_error: &msg,
                };
                if let Err(e) = self.retry_queue.enqueue(&item, now).await {
                    error!(event_id = %event.id, error = %e, "Failed to queue retry, releasing ledger entry");
                    self.release(&event.id).await;
                    return Err(e);
                }
                self.record(&event.id, LedgerOutcome::Failed, Some(&msg), now).await;
                Ok(IngestOutcome::QueuedForRetry)
            }
            Err(ProcessingError::Permanent(msg)) => {
                error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %msg,
                    alert = true,
                    "Permanent processing failure, moving event to dead letter"
                );
                let item =
                    DeadLetterItem::new(&event.id, &event.event_type, raw, 0, &msg, now);
                if let Err(e) = self.retry_queue.insert_dead_letter(&item).await {
                    error!(event_id = %event.id, error = %e, "Failed to write dead letter, releasing ledger entry");
                    self.release(&event.id).await;
                    return Err(e);
                }
                self.record(&event.id, LedgerOutcome::Failed, Some(&msg), now).await;
                Ok(IngestOutcome::DeadLettered)
            }
        }
    }

    /// Runs the handler for `event` within the processing timeout. Notices for the committed
    /// change are held in the returned value until [`Self::send_notices`].
    ///
    /// Skips the ledger: callers decide whether the event may run.
    pub async fn apply_event(
        &self,
        event: &BillingEvent,
        now: NaiveDateTime,
    ) -> Result<Processed, ProcessingError> {
        let routed = tokio::time::timeout(self.processing_timeout, self.route(event, now))
            .await
            .map_err(|_| {
                ProcessingError::Transient(format!(
                    "processing exceeded {}ms",
                    self.processing_timeout.as_millis()
                ))
            })??;

        Ok(match routed {
            Routed::Applied(change) => {
                if let Some(reason) = change.skipped {
                    info!(event_id = %event.id, reason = ?reason, "Event applied as no-op");
                }
                Processed {
                    result: RouteResult::Applied,
                    change: Some(change),
                }
            }
            Routed::UnknownSubscription => {
                info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    provider_subscription_id = ?event.provider_subscription_id(),
                    "Event for unknown subscription, nothing to apply"
                );
                Processed::without_change(RouteResult::UnknownSubscription)
            }
            Routed::Ignored => {
                debug!(event_id = %event.id, event_type = %event.event_type, "Unhandled event type acknowledged");
                Processed::without_change(RouteResult::Ignored)
            }
        })
    }

    pub async fn send_notices(&self, processed: &Processed, now: NaiveDateTime) {
        if let Some(change) = &processed.change {
            self.dispatcher.dispatch(change, now).await;
        }
    }

    pub fn processing_timeout(&self) -> Duration {
        self.processing_timeout
    }

    async fn route(&self, event: &BillingEvent, now: NaiveDateTime) -> Result<Routed, ProcessingError> {
        let created = event.created;
        let ctx = TransitionContext {
            policy: &self.policy,
            actor: Actor::System,
            now,
            event_id: Some(&event.id),
        };

        match &event.kind {
            BillingEventKind::SubscriptionCreated(snapshot)
            | BillingEventKind::SubscriptionUpdated(snapshot) => {
                let locator = SubscriptionLocator::Provider {
                    subscription_id: snapshot.provider_subscription_id.clone(),
                    customer_id: Some(snapshot.provider_customer_id.clone()),
                };
                self.apply(&locator, &|locked: &LockedSubscription| {
                    on_subscription_event(locked, snapshot, created, false, &ctx)
                })
                .await
            }
            BillingEventKind::SubscriptionDeleted(snapshot) => {
                let locator = SubscriptionLocator::Provider {
                    subscription_id: snapshot.provider_subscription_id.clone(),
                    customer_id: Some(snapshot.provider_customer_id.clone()),
                };
                self.apply(&locator, &|locked: &LockedSubscription| {
                    on_subscription_event(locked, snapshot, created, true, &ctx)
                })
                .await
            }
            BillingEventKind::InvoicePaymentSucceeded(invoice) => {
                let Some(subscription_id) = invoice.provider_subscription_id.clone() else {
                    return Ok(Routed::UnknownSubscription);
                };
                let locator = SubscriptionLocator::Provider {
                    subscription_id,
                    customer_id: None,
                };
                self.apply(&locator, &|locked: &LockedSubscription| {
                    on_invoice_paid(locked, invoice, created, &ctx)
                })
                .await
            }
            BillingEventKind::InvoicePaymentFailed(invoice) => {
                let Some(subscription_id) = invoice.provider_subscription_id.clone() else {
                    return Ok(Routed::UnknownSubscription);
                };
                let locator = SubscriptionLocator::Provider {
                    subscription_id,
                    customer_id: None,
                };
                self.apply(&locator, &|locked: &LockedSubscription| {
                    on_invoice_payment_failed(locked, invoice, created, &ctx)
                })
                .await
            }
            BillingEventKind::PaymentIntentSucceeded(intent)
            | BillingEventKind::PaymentIntentFailed(intent) => {
                let Some(subscription_id) = intent.provider_subscription_id.clone() else {
                    return Ok(Routed::UnknownSubscription);
                };
                let succeeded = matches!(event.kind, BillingEventKind::PaymentIntentSucceeded(_));
                let locator = SubscriptionLocator::Provider {
                    subscription_id,
                    customer_id: None,
                };
                self.apply(&locator, &|locked: &LockedSubscription| {
                    on_payment_intent(locked, intent, succeeded, &ctx)
                })
                .await
            }
            BillingEventKind::Unknown => Ok(Routed::Ignored),
        }
    }

    async fn apply(
        &self,
        locator: &SubscriptionLocator,
        decide: Decide<'_>,
    ) -> Result<Routed, ProcessingError> {
        let change = self.subscriptions.apply_locked(locator, decide).await?;
        Ok(match change {
            Some(change) => Routed::Applied(change),
            None => Routed::UnknownSubscription,
        })
    }

    /// Lets a redelivery of `event_id` run again. Used when the event could not be parked in
    /// the retry queue or dead letters, since it would otherwise be lost behind its ledger entry.
    async fn release(&self, event_id: &str) {
        if let Err(e) = self.ledger.reset_for_replay(event_id).await {
            error!(event_id, error = %e, "Failed to release ledger entry");
        }
    }

    async fn record(
        &self,
        event_id: &str,
        outcome: LedgerOutcome,
        error: Option<&str>,
        now: NaiveDateTime,
    ) {
        if let Err(e) = self.ledger.record_outcome(event_id, outcome, error, now).await {
            error!(event_id, outcome = %outcome, error = %e, "Failed to record ledger outcome");
        }
    }
}

/// A committed handler run whose notices have not been sent yet.
#[derive(Debug)]
pub struct Processed {
    pub result: RouteResult,
    change: Option<SubscriptionChange>,
}

impl Processed {
    fn without_change(result: RouteResult) -> Self {
        Processed {
            result,
            change: None,
        }
    }
}

enum Routed {
    Applied(SubscriptionChange),
    UnknownSubscription,
    Ignored,
}
