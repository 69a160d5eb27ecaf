use async_trait::async_trait;
use uuid::Uuid;

use crate::app_error::AppResult;

/// Paid-access check offered to the rest of the platform.
#[async_trait]
pub trait EntitlementReader: Send + Sync {
    async fn is_entitled(&self, user_id: Uuid) -> AppResult<bool>;
}
