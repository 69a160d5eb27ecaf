//! Provider webhook payloads, parsed into a closed set of event kinds.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventParseError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid field {field}: {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },
}

/// Fields of a provider subscription object the reconciler cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSnapshot {
    pub provider_subscription_id: String,
    pub provider_customer_id: String,
    pub status: String,
    pub price_id: Option<String>,
    pub current_period_start: Option<NaiveDateTime>,
    pub current_period_end: Option<NaiveDateTime>,
    pub cancel_at_period_end: bool,
    pub trial_start: Option<NaiveDateTime>,
    pub trial_end: Option<NaiveDateTime>,
    pub latest_invoice_id: Option<String>,
}

/// Fields of a provider invoice object the reconciler cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceSnapshot {
    pub provider_invoice_id: String,
    pub provider_subscription_id: Option<String>,
    pub provider_customer_id: Option<String>,
    pub amount_due: i64,
    /// Provider's own count of charge attempts for this invoice, when reported.
    pub attempt_count: Option<i32>,
    pub next_payment_attempt: Option<NaiveDateTime>,
    pub failure_reason: Option<String>,
}

/// Fields of a provider payment intent. These events only leave an audit trail.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentIntentSnapshot {
    pub provider_payment_intent_id: String,
    pub provider_customer_id: Option<String>,
    /// Known only when the payload carries the expanded invoice.
    pub provider_subscription_id: Option<String>,
    pub amount: i64,
    pub currency: Option<String>,
    pub status: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BillingEventKind {
    SubscriptionCreated(SubscriptionSnapshot),
    SubscriptionUpdated(SubscriptionSnapshot),
    SubscriptionDeleted(SubscriptionSnapshot),
    InvoicePaymentSucceeded(InvoiceSnapshot),
    InvoicePaymentFailed(InvoiceSnapshot),
    PaymentIntentSucceeded(PaymentIntentSnapshot),
    PaymentIntentFailed(PaymentIntentSnapshot),
    /// Any type we do not handle. Acknowledged so new provider event types never fail delivery.
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BillingEvent {
    pub id: String,
    pub event_type: String,
    /// Provider-side creation time, used as the ordering marker.
    pub created: NaiveDateTime,
    pub kind: BillingEventKind,
}

impl BillingEvent {
    pub fn parse(raw: &str) -> Result<Self, EventParseError> {
        let envelope: Envelope =
            serde_json::from_str(raw).map_err(|e| EventParseError::InvalidJson(e.to_string()))?;

        let id = non_empty(envelope.id).ok_or(EventParseError::MissingField("id"))?;
        let event_type = non_empty(envelope.event_type).ok_or(EventParseError::MissingField("type"))?;
        let created = envelope.created.ok_or(EventParseError::MissingField("created"))?;
        let created = timestamp_to_naive(created).ok_or(EventParseError::InvalidField {
            field: "created",
            message: "out of range".into(),
        })?;
        let object = envelope
            .data
            .and_then(|d| d.object)
            .ok_or(EventParseError::MissingField("data.object"))?;

        let kind = match event_type.as_str() {
            "customer.subscription.created" => {
                BillingEventKind::SubscriptionCreated(parse_subscription(object)?)
            }
            "customer.subscription.updated" => {
                BillingEventKind::SubscriptionUpdated(parse_subscription(object)?)
            }
            "customer.subscription.deleted" => {
                BillingEventKind::SubscriptionDeleted(parse_subscription(object)?)
            }
            "invoice.paid" | "invoice.payment_succeeded" => {
                BillingEventKind::InvoicePaymentSucceeded(parse_invoice(object)?)
            }
            "invoice.payment_failed" => {
                BillingEventKind::InvoicePaymentFailed(parse_invoice(object)?)
            }
            "payment_intent.succeeded" => {
                BillingEventKind::PaymentIntentSucceeded(parse_payment_intent(object)?)
            }
            "payment_intent.payment_failed" => {
                BillingEventKind::PaymentIntentFailed(parse_payment_intent(object)?)
            }
            _ => BillingEventKind::Unknown,
        };

        Ok(BillingEvent {
            id,
            event_type,
            created,
            kind,
        })
    }

    /// Provider subscription id the event refers to, if any.
    pub fn provider_subscription_id(&self) -> Option<&str> {
        match &self.kind {
            BillingEventKind::SubscriptionCreated(s)
            | BillingEventKind::SubscriptionUpdated(s)
            | BillingEventKind::SubscriptionDeleted(s) => Some(&s.provider_subscription_id),
            BillingEventKind::InvoicePaymentSucceeded(i)
            | BillingEventKind::InvoicePaymentFailed(i) => i.provider_subscription_id.as_deref(),
            BillingEventKind::PaymentIntentSucceeded(p)
            | BillingEventKind::PaymentIntentFailed(p) => p.provider_subscription_id.as_deref(),
            BillingEventKind::Unknown => None,
        }
    }
}

// ============================================================================
// Wire shapes
// ============================================================================

#[derive(Deserialize)]
struct Envelope {
    id: Option<String>,
    #[serde(rename = "type")]
    event_type: Option<String>,
    created: Option<i64>,
    data: Option<EnvelopeData>,
}

#[derive(Deserialize)]
struct EnvelopeData {
    object: Option<JsonValue>,
}

/// The provider sends either a bare id or the expanded object.
#[derive(Deserialize)]
#[serde(untagged)]
enum IdOrObject {
    Id(String),
    Object { id: String },
}

impl IdOrObject {
    fn into_id(self) -> String {
        match self {
            IdOrObject::Id(id) | IdOrObject::Object { id } => id,
        }
    }
}

#[derive(Deserialize)]
struct RawSubscription {
    id: Option<String>,
    customer: Option<IdOrObject>,
    status: Option<String>,
    items: Option<RawItems>,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
    #[serde(default)]
    cancel_at_period_end: bool,
    trial_start: Option<i64>,
    trial_end: Option<i64>,
    latest_invoice: Option<IdOrObject>,
}

#[derive(Deserialize)]
struct RawItems {
    #[serde(default)]
    data: Vec<RawItem>,
}

#[derive(Deserialize)]
struct RawItem {
    price: Option<RawPrice>,
}

#[derive(Deserialize)]
struct RawPrice {
    id: Option<String>,
}

#[derive(Deserialize)]
struct RawInvoice {
    id: Option<String>,
    subscription: Option<IdOrObject>,
    customer: Option<IdOrObject>,
    #[serde(default)]
    amount_due: i64,
    attempt_count: Option<i32>,
    next_payment_attempt: Option<i64>,
    last_payment_error: Option<RawError>,
    last_finalization_error: Option<RawError>,
}

#[derive(Deserialize)]
struct RawError {
    code: Option<String>,
    message: Option<String>,
}

#[derive(Deserialize)]
struct RawPaymentIntent {
    id: Option<String>,
    customer: Option<IdOrObject>,
    invoice: Option<RawIntentInvoice>,
    #[serde(default)]
    amount: i64,
    currency: Option<String>,
    status: Option<String>,
    last_payment_error: Option<RawError>,
}

/// A payment intent's invoice. Only the expanded form names its subscription.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawIntentInvoice {
    Id(String),
    Object { subscription: Option<IdOrObject> },
}

fn parse_subscription(object: JsonValue) -> Result<SubscriptionSnapshot, EventParseError> {
    let raw: RawSubscription =
        serde_json::from_value(object).map_err(|e| EventParseError::InvalidField {
            field: "data.object",
            message: e.to_string(),
        })?;

    let price_id = raw
        .items
        .and_then(|items| items.data.into_iter().next())
        .and_then(|item| item.price)
        .and_then(|price| non_empty(price.id));

    Ok(SubscriptionSnapshot {
        provider_subscription_id: non_empty(raw.id)
            .ok_or(EventParseError::MissingField("data.object.id"))?,
        provider_customer_id: raw
            .customer
            .map(IdOrObject::into_id)
            .and_then(|c| non_empty(Some(c)))
            .ok_or(EventParseError::MissingField("data.object.customer"))?,
        status: non_empty(raw.status).ok_or(EventParseError::MissingField("data.object.status"))?,
        price_id,
        current_period_start: raw.current_period_start.and_then(timestamp_to_naive),
        current_period_end: raw.current_period_end.and_then(timestamp_to_naive),
        cancel_at_period_end: raw.cancel_at_period_end,
        trial_start: raw.trial_start.and_then(timestamp_to_naive),
        trial_end: raw.trial_end.and_then(timestamp_to_naive),
        latest_invoice_id: raw.latest_invoice.map(IdOrObject::into_id),
    })
}

fn parse_invoice(object: JsonValue) -> Result<InvoiceSnapshot, EventParseError> {
    let raw: RawInvoice =
        serde_json::from_value(object).map_err(|e| EventParseError::InvalidField {
            field: "data.object",
            message: e.to_string(),
        })?;

    let failure_reason = raw
        .last_payment_error
        .and_then(|e| e.message)
        .or_else(|| raw.last_finalization_error.and_then(|e| e.message));

    Ok(InvoiceSnapshot {
        provider_invoice_id: non_empty(raw.id)
            .ok_or(EventParseError::MissingField("data.object.id"))?,
        provider_subscription_id: raw.subscription.map(IdOrObject::into_id),
        provider_customer_id: raw.customer.map(IdOrObject::into_id),
        amount_due: raw.amount_due,
        attempt_count: raw.attempt_count,
        next_payment_attempt: raw.next_payment_attempt.and_then(timestamp_to_naive),
        failure_reason,
    })
}

fn parse_payment_intent(object: JsonValue) -> Result<PaymentIntentSnapshot, EventParseError> {
    let raw: RawPaymentIntent =
        serde_json::from_value(object).map_err(|e| EventParseError::InvalidField {
            field: "data.object",
            message: e.to_string(),
        })?;

    let provider_subscription_id = match raw.invoice {
        Some(RawIntentInvoice::Object { subscription }) => subscription.map(IdOrObject::into_id),
        Some(RawIntentInvoice::Id(_)) | None => None,
    };
    let (error_code, error_message) = raw
        .last_payment_error
        .map(|e| (e.code, e.message))
        .unwrap_or_default();

    Ok(PaymentIntentSnapshot {
        provider_payment_intent_id: non_empty(raw.id)
            .ok_or(EventParseError::MissingField("data.object.id"))?,
        provider_customer_id: raw.customer.map(IdOrObject::into_id),
        provider_subscription_id,
        amount: raw.amount,
        currency: raw.currency,
        status: raw.status,
        error_code,
        error_message,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Convert a Unix timestamp to NaiveDateTime
pub fn timestamp_to_naive(secs: i64) -> Option<NaiveDateTime> {
    DateTime::<Utc>::from_timestamp(secs, 0).map(|dt| dt.naive_utc())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn subscription_event(event_type: &str) -> String {
        json!({
            "id": "evt_1",
            "type": event_type,
            "created": 1_706_500_000,
            "data": {
                "object": {
                    "id": "sub_1",
                    "customer": "cus_1",
                    "status": "active",
                    "items": { "data": [ { "price": { "id": "price_pro" } } ] },
                    "current_period_start": 1_706_500_000,
                    "current_period_end": 1_709_000_000,
                    "cancel_at_period_end": false,
                    "latest_invoice": { "id": "in_1", "status": "open" }
                }
            }
        })
        .to_string()
    }

    #[test]
    fn parses_subscription_update() {
        let event = BillingEvent::parse(&subscription_event("customer.subscription.updated")).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.created, timestamp_to_naive(1_706_500_000).unwrap());

        let BillingEventKind::SubscriptionUpdated(snapshot) = event.kind else {
            panic!("expected subscription update");
        };
        assert_eq!(snapshot.provider_subscription_id, "sub_1");
        assert_eq!(snapshot.provider_customer_id, "cus_1");
        assert_eq!(snapshot.price_id.as_deref(), Some("price_pro"));
        assert_eq!(snapshot.latest_invoice_id.as_deref(), Some("in_1"));
    }

    #[test]
    fn both_invoice_success_names_map_to_one_kind() {
        for event_type in ["invoice.paid", "invoice.payment_succeeded"] {
            let raw = json!({
                "id": "evt_2",
                "type": event_type,
                "created": 1_706_500_000,
                "data": { "object": { "id": "in_1", "subscription": "sub_1", "amount_due": 1900 } }
            })
            .to_string();
            let event = BillingEvent::parse(&raw).unwrap();
            assert!(matches!(event.kind, BillingEventKind::InvoicePaymentSucceeded(_)));
            assert_eq!(event.provider_subscription_id(), Some("sub_1"));
        }
    }

    #[test]
    fn payment_failure_reads_attempt_count_and_reason() {
        let raw = json!({
            "id": "evt_3",
            "type": "invoice.payment_failed",
            "created": 1_706_500_000,
            "data": { "object": {
                "id": "in_1",
                "subscription": "sub_1",
                "amount_due": 1900,
                "attempt_count": 2,
                "next_payment_attempt": 1_706_600_000,
                "last_payment_error": { "message": "card_declined" }
            } }
        })
        .to_string();
        let BillingEventKind::InvoicePaymentFailed(invoice) = BillingEvent::parse(&raw).unwrap().kind
        else {
            panic!("expected payment failure");
        };
        assert_eq!(invoice.attempt_count, Some(2));
        assert_eq!(invoice.failure_reason.as_deref(), Some("card_declined"));
        assert!(invoice.next_payment_attempt.is_some());
    }

    #[test]
    fn unknown_types_are_kept_as_unknown() {
        let raw = json!({
            "id": "evt_4",
            "type": "payment_intent.created",
            "created": 1_706_500_000,
            "data": { "object": { "id": "pi_1" } }
        })
        .to_string();
        let event = BillingEvent::parse(&raw).unwrap();
        assert_eq!(event.kind, BillingEventKind::Unknown);
        assert_eq!(event.event_type, "payment_intent.created");
    }

    #[test]
    fn payment_intent_reads_subscription_from_expanded_invoice() {
        let raw = json!({
            "id": "evt_5",
            "type": "payment_intent.payment_failed",
            "created": 1_706_500_000,
            "data": { "object": {
                "id": "pi_1",
                "customer": "cus_1",
                "amount": 1900,
                "currency": "usd",
                "status": "requires_payment_method",
                "invoice": { "id": "in_1", "subscription": "sub_1" },
                "last_payment_error": { "code": "card_declined", "message": "Your card was declined." }
            } }
        })
        .to_string();
        let event = BillingEvent::parse(&raw).unwrap();
        assert_eq!(event.provider_subscription_id(), Some("sub_1"));
        let BillingEventKind::PaymentIntentFailed(intent) = event.kind else {
            panic!("expected payment intent failure");
        };
        assert_eq!(intent.provider_payment_intent_id, "pi_1");
        assert_eq!(intent.amount, 1900);
        assert_eq!(intent.currency.as_deref(), Some("usd"));
        assert_eq!(intent.error_code.as_deref(), Some("card_declined"));
        assert_eq!(intent.error_message.as_deref(), Some("Your card was declined."));

        // A bare invoice id does not say which subscription it belongs to.
        let raw = json!({
            "id": "evt_6",
            "type": "payment_intent.succeeded",
            "created": 1_706_500_000,
            "data": { "object": { "id": "pi_2", "amount": 1900, "invoice": "in_2" } }
        })
        .to_string();
        let event = BillingEvent::parse(&raw).unwrap();
        assert!(matches!(event.kind, BillingEventKind::PaymentIntentSucceeded(_)));
        assert_eq!(event.provider_subscription_id(), None);
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(matches!(
            BillingEvent::parse("{not json"),
            Err(EventParseError::InvalidJson(_))
        ));
        assert_eq!(
            BillingEvent::parse(r#"{"type":"invoice.paid","created":1,"data":{"object":{}}}"#),
            Err(EventParseError::MissingField("id"))
        );
        assert_eq!(
            BillingEvent::parse(r#"{"id":"evt","type":"invoice.paid","created":1}"#),
            Err(EventParseError::MissingField("data.object"))
        );
        assert_eq!(
            BillingEvent::parse(
                r#"{"id":"evt","type":"customer.subscription.updated","created":1,"data":{"object":{"id":"sub_1","status":"active"}}}"#
            ),
            Err(EventParseError::MissingField("data.object.customer"))
        );
    }
}
