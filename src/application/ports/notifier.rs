use async_trait::async_trait;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::{app_error::AppResult, domain::entities::payment_failure::NotificationKind};

/// Outbound user messaging. Fire-and-forget from billing's point of view: an error is
/// logged by the caller and never rolls back a state change.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: Uuid, kind: NotificationKind, payload: JsonValue) -> AppResult<()>;
}
