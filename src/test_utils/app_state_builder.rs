//! Test app state builder for HTTP-level testing.
//!
//! This module provides `TestAppStateBuilder` which wires a real `AppState` over the
//! in-memory store and a recording notifier.

use std::sync::Arc;

use secrecy::SecretString;

use crate::{
    adapters::http::app_state::AppState,
    infra::{config::BillingConfig, setup::build_app_state},
    test_utils::{InMemoryBillingStore, RecordingNotifier, TEST_PRO_PRICE},
};

pub const TEST_WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const TEST_ADMIN_TOKEN: &str = "test_admin_token";

/// Builder for creating `AppState` with in-memory mocks for testing.
///
/// # Example
///
/// ```ignore
/// let store = Arc::new(InMemoryBillingStore::new());
/// let app_state = TestAppStateBuilder::new()
///     .with_store(store.clone())
///     .with_webhook_secrets(&["whsec_new", "whsec_old"])
///     .build();
/// ```
pub struct TestAppStateBuilder {
    store: Arc<InMemoryBillingStore>,
    notifier: Arc<RecordingNotifier>,
    config: BillingConfig,
}

impl TestAppStateBuilder {
    pub fn new() -> Self {
        let config = BillingConfig {
            webhook_secrets: vec![SecretString::new(TEST_WEBHOOK_SECRET.into())],
            pro_price_ids: vec![TEST_PRO_PRICE.to_string()],
            ..Default::default()
        };

        Self {
            store: Arc::new(InMemoryBillingStore::new()),
            notifier: Arc::new(RecordingNotifier::new()),
            config,
        }
    }

    /// Share a store with the test so it can seed rows and inspect writes.
    pub fn with_store(mut self, store: Arc<InMemoryBillingStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<RecordingNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Replace the configured secrets, in order.
    pub fn with_webhook_secrets(mut self, secrets: &[&str]) -> Self {
        self.config.webhook_secrets = secrets
            .iter()
            .map(|s| SecretString::new((*s).into()))
            .collect();
        self
    }

    pub fn with_max_payload_bytes(mut self, limit: usize) -> Self {
        self.config.max_webhook_payload_bytes = limit;
        self
    }

    pub fn build(self) -> AppState {
        build_app_state(
            &self.config,
            SecretString::new(TEST_ADMIN_TOKEN.into()),
            self.store,
            self.notifier,
        )
    }
}

impl Default for TestAppStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}
