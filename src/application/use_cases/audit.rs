use async_trait::async_trait;
use uuid::Uuid;

use crate::{app_error::AppResult, domain::entities::audit::AuditEntry};

pub const DEFAULT_AUDIT_LIMIT: i64 = 100;
pub const MAX_AUDIT_LIMIT: i64 = 500;

/// Read side of the audit log. Entries are only written inside a subscription transition.
#[async_trait]
pub trait AuditRepoTrait: Send + Sync {
    async fn list_by_entity(&self, entity_id: Uuid, limit: i64) -> AppResult<Vec<AuditEntry>>;
}
