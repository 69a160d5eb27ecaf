use std::sync::Arc;

use axum::extract::FromRef;
use secrecy::SecretString;

use crate::{
    infra::{config::BillingConfig, signature::SignatureVerifier},
    use_cases::{
        dunning::DunningUseCases, reconcile::ReconcileUseCases, retry::RetryUseCases,
        subscription::SubscriptionUseCases,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BillingConfig>,
    pub admin_api_token: Arc<SecretString>,
    pub signature_verifier: Arc<SignatureVerifier>,
    pub reconcile_use_cases: Arc<ReconcileUseCases>,
    pub retry_use_cases: Arc<RetryUseCases>,
    pub subscription_use_cases: Arc<SubscriptionUseCases>,
    pub dunning_use_cases: Arc<DunningUseCases>,
}

impl FromRef<AppState> for Arc<ReconcileUseCases> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.reconcile_use_cases.clone()
    }
}

impl FromRef<AppState> for Arc<RetryUseCases> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.retry_use_cases.clone()
    }
}

impl FromRef<AppState> for Arc<SubscriptionUseCases> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.subscription_use_cases.clone()
    }
}
