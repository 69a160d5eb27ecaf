//! Provider webhook bodies shaped like real deliveries.

use chrono::NaiveDateTime;
use serde_json::{Value as JsonValue, json};

fn envelope(event_id: &str, event_type: &str, created: NaiveDateTime, object: JsonValue) -> String {
    json!({
        "id": event_id,
        "object": "event",
        "type": event_type,
        "created": created.and_utc().timestamp(),
        "livemode": false,
        "data": { "object": object },
    })
    .to_string()
}

/// `customer.subscription.*` event for `sub_id` owned by `cus_1`.
pub fn subscription_payload(
    event_id: &str,
    event_type: &str,
    sub_id: &str,
    status: &str,
    price_id: Option<&str>,
    created: NaiveDateTime,
) -> String {
    let items = match price_id {
        Some(price) => json!({ "object": "list", "data": [{ "price": { "id": price } }] }),
        None => json!({ "object": "list", "data": [] }),
    };
    envelope(
        event_id,
        event_type,
        created,
        json!({
            "id": sub_id,
            "object": "subscription",
            "customer": "cus_1",
            "status": status,
            "items": items,
            "cancel_at_period_end": false,
            "latest_invoice": "in_1",
        }),
    )
}

pub fn invoice_failed_payload(
    event_id: &str,
    sub_id: &str,
    invoice_id: &str,
    attempt_count: i32,
    created: NaiveDateTime,
) -> String {
    envelope(
        event_id,
        "invoice.payment_failed",
        created,
        json!({
            "id": invoice_id,
            "object": "invoice",
            "subscription": sub_id,
            "customer": "cus_1",
            "amount_due": 1900,
            "attempt_count": attempt_count,
            "last_payment_error": { "message": "Your card was declined." },
        }),
    )
}

pub fn invoice_paid_payload(
    event_id: &str,
    sub_id: &str,
    invoice_id: &str,
    created: NaiveDateTime,
) -> String {
    envelope(
        event_id,
        "invoice.paid",
        created,
        json!({
            "id": invoice_id,
            "object": "invoice",
            "subscription": sub_id,
            "customer": "cus_1",
            "amount_due": 1900,
            "attempt_count": 1,
        }),
    )
}

/// `payment_intent.*` event. The invoice is expanded only when `sub_id` is given.
pub fn payment_intent_payload(
    event_id: &str,
    event_type: &str,
    sub_id: Option<&str>,
    created: NaiveDateTime,
) -> String {
    let invoice = match sub_id {
        Some(sub_id) => json!({ "id": "in_1", "object": "invoice", "subscription": sub_id }),
        None => json!("in_1"),
    };
    let mut object = json!({
        "id": "pi_1",
        "object": "payment_intent",
        "customer": "cus_1",
        "amount": 1900,
        "currency": "usd",
        "status": "succeeded",
        "invoice": invoice,
    });
    if event_type == "payment_intent.payment_failed" {
        object["status"] = json!("requires_payment_method");
        object["last_payment_error"] =
            json!({ "code": "card_declined", "message": "Your card was declined." });
    }
    envelope(event_id, event_type, created, object)
}

/// An event type the reconciler does not handle.
pub fn unhandled_payload(event_id: &str, created: NaiveDateTime) -> String {
    envelope(
        event_id,
        "charge.refunded",
        created,
        json!({ "id": "ch_1", "object": "charge" }),
    )
}
