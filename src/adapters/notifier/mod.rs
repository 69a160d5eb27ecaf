use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::info;
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult},
    application::ports::notifier::Notifier,
    domain::entities::payment_failure::NotificationKind,
};

/// Connect timeout (TCP handshake + TLS).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total request time. Notices are sent after commit, so a slow messaging service only
/// delays the caller, never the state change.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// POSTs each notice as JSON to the messaging service.
#[derive(Clone)]
pub struct HttpNotifier {
    client: Client,
    url: url::Url,
}

impl HttpNotifier {
    pub fn new(url: url::Url) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client, url })
    }
}

#[derive(Serialize)]
struct NotifyReq<'a> {
    user_id: Uuid,
    kind: NotificationKind,
    payload: &'a JsonValue,
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, user_id: Uuid, kind: NotificationKind, payload: JsonValue) -> AppResult<()> {
        let body = NotifyReq {
            user_id,
            kind,
            payload: &payload,
        };
        self.client
            .post(self.url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Internal(format!("Notifier request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| AppError::Internal(format!("Notifier rejected notice: {}", e)))?;
        Ok(())
    }
}

/// Writes notices to the log. Used when no messaging service is configured.
#[derive(Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user_id: Uuid, kind: NotificationKind, payload: JsonValue) -> AppResult<()> {
        info!(user_id = %user_id, kind = %kind, payload = %payload, "Billing notice");
        Ok(())
    }
}
