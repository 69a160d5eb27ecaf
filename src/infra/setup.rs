use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};

use secrecy::{ExposeSecret, SecretString};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    adapters::{
        http::app_state::AppState,
        notifier::{HttpNotifier, LogNotifier},
    },
    application::ports::notifier::Notifier,
    infra::{
        config::{AppConfig, BillingConfig},
        db::run_migrations,
        error::InfraError,
        postgres_persistence,
    },
    use_cases::{
        audit::AuditRepoTrait,
        dunning::{DunningUseCases, NotificationDispatcher},
        ledger::LedgerRepoTrait,
        reconcile::ReconcileUseCases,
        retry::{RetryQueueRepoTrait, RetryUseCases},
        subscription::{SubscriptionRepoTrait, SubscriptionUseCases},
    },
};

pub async fn init_app_state(config: &AppConfig) -> anyhow::Result<AppState> {
    let postgres_arc = Arc::new(
        postgres_persistence(
            config.database_url.expose_secret(),
            config.database_max_connections,
        )
        .await?,
    );

    if config.run_migrations {
        run_migrations(postgres_arc.pool()).await?;
    }

    let notifier: Arc<dyn Notifier> = match &config.notifier_url {
        Some(url) => {
            info!(url = %url, "Sending billing notices over HTTP");
            Arc::new(HttpNotifier::new(url.clone()).map_err(InfraError::HttpClient)?)
        }
        None => {
            info!("NOTIFIER_URL not set, billing notices will only be logged");
            Arc::new(LogNotifier)
        }
    };

    Ok(build_app_state(
        &config.billing,
        config.admin_api_token.clone(),
        postgres_arc,
        notifier,
    ))
}

/// Wires the use cases over one store that implements every repository trait.
pub fn build_app_state<S>(
    billing: &BillingConfig,
    admin_api_token: SecretString,
    store: Arc<S>,
    notifier: Arc<dyn Notifier>,
) -> AppState
where
    S: SubscriptionRepoTrait + LedgerRepoTrait + RetryQueueRepoTrait + AuditRepoTrait + 'static,
{
    let subscription_repo = store.clone() as Arc<dyn SubscriptionRepoTrait>;
    let ledger_repo = store.clone() as Arc<dyn LedgerRepoTrait>;
    let retry_repo = store.clone() as Arc<dyn RetryQueueRepoTrait>;
    let audit_repo = store as Arc<dyn AuditRepoTrait>;

    let dispatcher = Arc::new(NotificationDispatcher::new(
        notifier,
        subscription_repo.clone(),
    ));

    let reconcile_use_cases = Arc::new(ReconcileUseCases::new(
        billing.provider.clone(),
        ledger_repo.clone(),
        subscription_repo.clone(),
        retry_repo.clone(),
        dispatcher.clone(),
        billing.policy(),
        billing.retry_policy(),
        billing.processing_timeout(),
    ));

    let retry_use_cases = Arc::new(RetryUseCases::new(
        retry_repo,
        ledger_repo,
        reconcile_use_cases.clone(),
        billing.retry_policy(),
        billing.retry_batch_size,
        billing.claim_lease(),
    ));

    let subscription_use_cases = Arc::new(SubscriptionUseCases::new(
        subscription_repo.clone(),
        audit_repo,
        billing.policy(),
    ));

    let dunning_use_cases = Arc::new(DunningUseCases::new(
        subscription_repo,
        dispatcher,
        billing.policy(),
    ));

    AppState {
        config: Arc::new(billing.clone()),
        admin_api_token: Arc::new(admin_api_token),
        signature_verifier: Arc::new(billing.signature_verifier()),
        reconcile_use_cases,
        retry_use_cases,
        subscription_use_cases,
        dunning_use_cases,
    }
}

pub fn init_tracing(log_file: Option<&str>) -> Result<(), InfraError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "billing_reconciler=debug,tower_http=debug".into());

    // Console (pretty logs)
    let console_layer = fmt::layer()
        .with_target(false) // don't show target (module path)
        .with_level(true) // show log level
        .pretty(); // human-friendly, with colors

    // File (structured JSON logs), only when LOG_FILE is set
    let json_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(InfraError::LogFile)?;
            Some(
                fmt::layer()
                    .json()
                    .with_writer(Mutex::new(file))
                    .with_current_span(true)
                    .with_span_list(true),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(json_layer)
        .try_init()
        .ok();

    Ok(())
}
