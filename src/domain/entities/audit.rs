use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Who caused a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum Actor {
    /// Webhook deliveries and background sweeps.
    System,
    User(Uuid),
}

impl Actor {
    /// Storage form: `system` or the user's uuid.
    pub fn as_db_string(&self) -> String {
        match self {
            Actor::System => "system".to_string(),
            Actor::User(id) => id.to_string(),
        }
    }

    pub fn from_db_string(value: &str) -> Self {
        match Uuid::parse_str(value) {
            Ok(id) => Actor::User(id),
            Err(_) => Actor::System,
        }
    }
}

pub mod actions {
    pub const SUBSCRIPTION_CREATED: &str = "subscription.created";
    pub const SUBSCRIPTION_STATUS_CHANGED: &str = "subscription.status_changed";
    pub const SUBSCRIPTION_PLAN_CHANGED: &str = "subscription.plan_changed";
    pub const SUBSCRIPTION_LINKED: &str = "subscription.linked";
    pub const SUBSCRIPTION_CANCELED: &str = "subscription.canceled";
    pub const SUBSCRIPTION_DOWNGRADED: &str = "subscription.downgraded";
    pub const PAYMENT_FAILURE_OPENED: &str = "payment_failure.opened";
    pub const PAYMENT_FAILURE_UPDATED: &str = "payment_failure.updated";
    pub const PAYMENT_FAILURE_RESOLVED: &str = "payment_failure.resolved";
    pub const DUNNING_ATTEMPT_RECORDED: &str = "dunning.attempt_recorded";
    pub const PAYMENT_INTENT_SUCCEEDED: &str = "payment_intent.succeeded";
    pub const PAYMENT_INTENT_FAILED: &str = "payment_intent.failed";
}

/// Append-only compliance record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub actor: Actor,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub metadata: JsonValue,
    pub created_at: NaiveDateTime,
}

impl AuditEntry {
    pub fn new(
        actor: Actor,
        action: &str,
        entity_type: &str,
        entity_id: Uuid,
        metadata: JsonValue,
        now: NaiveDateTime,
    ) -> Self {
        AuditEntry {
            id: Uuid::new_v4(),
            actor,
            action: action.to_string(),
            entity_type: entity_type.to_string(),
            entity_id,
            metadata,
            created_at: now,
        }
    }
}
