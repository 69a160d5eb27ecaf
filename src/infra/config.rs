use std::{net::SocketAddr, str::FromStr, time::Duration as StdDuration};

use env_helpers::get_env_default;
use secrecy::SecretString;
use url::Url;

use crate::{
    domain::policy::BillingPolicy,
    infra::{
        error::InfraError,
        signature::{DEFAULT_TOLERANCE_SECS, SignatureVerifier},
    },
    use_cases::retry::RetryPolicy,
};

/// Everything the reconciler, dunning workflow and retry scheduler need.
/// Built once at startup and handed to constructors.
#[derive(Clone)]
pub struct BillingConfig {
    /// Ordered; the first entry is the current secret, later ones are being rotated out.
    pub webhook_secrets: Vec<SecretString>,
    pub provider: String,
    pub signature_header: String,
    pub replay_tolerance_secs: i64,
    // TODO: confirm the grace period length with product; 3 days is a placeholder.
    pub grace_period_days: i64,
    pub max_dunning_attempts: i32,
    pub grace_warning_window_hours: i64,
    pub retry_backoff_base_secs: i64,
    pub retry_backoff_cap_secs: i64,
    pub retry_backoff_jitter: f64,
    pub max_processing_retries: i32,
    pub retry_poll_interval_secs: u64,
    pub retry_batch_size: i64,
    pub retry_claim_lease_secs: i64,
    pub processing_timeout_ms: u64,
    pub max_webhook_payload_bytes: usize,
    pub pro_price_ids: Vec<String>,
    pub grace_expiry_interval_secs: u64,
    pub grace_warning_interval_secs: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            webhook_secrets: Vec::new(),
            provider: "stripe".to_string(),
            signature_header: "stripe-signature".to_string(),
            replay_tolerance_secs: DEFAULT_TOLERANCE_SECS,
            grace_period_days: 3,
            max_dunning_attempts: 3,
            grace_warning_window_hours: 48,
            retry_backoff_base_secs: 30,
            retry_backoff_cap_secs: 3600,
            retry_backoff_jitter: 0.2,
            max_processing_retries: 5,
            retry_poll_interval_secs: 60,
            retry_batch_size: 100,
            retry_claim_lease_secs: 300,
            processing_timeout_ms: 10_000,
            max_webhook_payload_bytes: 64 * 1024,
            pro_price_ids: Vec::new(),
            grace_expiry_interval_secs: 3600,
            grace_warning_interval_secs: 86_400,
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn required_env(var: &'static str) -> Result<String, InfraError> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(InfraError::ConfigMissing { var })
}

fn optional_env<T: FromStr>(var: &'static str) -> Result<Option<T>, InfraError> {
    match std::env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| InfraError::ConfigInvalid { var }),
        _ => Ok(None),
    }
}

impl BillingConfig {
    pub fn from_env() -> Result<Self, InfraError> {
        let defaults = Self::default();

        let webhook_secrets: Vec<SecretString> = split_list(&required_env("WEBHOOK_SECRETS")?)
            .into_iter()
            .map(|s| SecretString::new(s.into()))
            .collect();
        if webhook_secrets.is_empty() {
            return Err(InfraError::ConfigMissing {
                var: "WEBHOOK_SECRETS",
            });
        }

        let retry_backoff_jitter: f64 =
            get_env_default("RETRY_BACKOFF_JITTER", defaults.retry_backoff_jitter);
        if !(0.0..1.0).contains(&retry_backoff_jitter) {
            return Err(InfraError::ConfigInvalid {
                var: "RETRY_BACKOFF_JITTER",
            });
        }

        let config = Self {
            webhook_secrets,
            provider: get_env_default("WEBHOOK_PROVIDER", defaults.provider),
            signature_header: get_env_default("WEBHOOK_SIGNATURE_HEADER", defaults.signature_header)
                .to_ascii_lowercase(),
            replay_tolerance_secs: get_env_default(
                "WEBHOOK_REPLAY_TOLERANCE_SECS",
                defaults.replay_tolerance_secs,
            ),
            grace_period_days: get_env_default("GRACE_PERIOD_DAYS", defaults.grace_period_days),
            max_dunning_attempts: get_env_default(
                "MAX_DUNNING_ATTEMPTS",
                defaults.max_dunning_attempts,
            ),
            grace_warning_window_hours: get_env_default(
                "GRACE_WARNING_WINDOW_HOURS",
                defaults.grace_warning_window_hours,
            ),
            retry_backoff_base_secs: get_env_default(
                "RETRY_BACKOFF_BASE_SECS",
                defaults.retry_backoff_base_secs,
            ),
            retry_backoff_cap_secs: get_env_default(
                "RETRY_BACKOFF_CAP_SECS",
                defaults.retry_backoff_cap_secs,
            ),
            retry_backoff_jitter,
            max_processing_retries: get_env_default(
                "MAX_PROCESSING_RETRIES",
                defaults.max_processing_retries,
            ),
            retry_poll_interval_secs: get_env_default(
                "RETRY_POLL_INTERVAL_SECS",
                defaults.retry_poll_interval_secs,
            ),
            retry_batch_size: get_env_default("RETRY_BATCH_SIZE", defaults.retry_batch_size),
            retry_claim_lease_secs: get_env_default(
                "RETRY_CLAIM_LEASE_SECS",
                defaults.retry_claim_lease_secs,
            ),
            processing_timeout_ms: get_env_default(
                "PROCESSING_TIMEOUT_MS",
                defaults.processing_timeout_ms,
            ),
            max_webhook_payload_bytes: get_env_default(
                "MAX_WEBHOOK_PAYLOAD_BYTES",
                defaults.max_webhook_payload_bytes,
            ),
            pro_price_ids: split_list(&get_env_default("PRO_PRICE_IDS", String::new())),
            grace_expiry_interval_secs: get_env_default(
                "GRACE_EXPIRY_INTERVAL_SECS",
                defaults.grace_expiry_interval_secs,
            ),
            grace_warning_interval_secs: get_env_default(
                "GRACE_WARNING_INTERVAL_SECS",
                defaults.grace_warning_interval_secs,
            ),
        };
        config.validate()?;
        Ok(config)
    }

    /// A retry claim must outlive one bounded processing run, otherwise a second worker can
    /// claim the item while the first is still applying it.
    pub fn validate(&self) -> Result<(), InfraError> {
        let timeout_ms = i64::try_from(self.processing_timeout_ms).unwrap_or(i64::MAX);
        if self.retry_claim_lease_secs.saturating_mul(1000) <= timeout_ms {
            return Err(InfraError::ConfigInvalid {
                var: "RETRY_CLAIM_LEASE_SECS",
            });
        }
        Ok(())
    }

    pub fn policy(&self) -> BillingPolicy {
        BillingPolicy {
            grace_period: chrono::Duration::days(self.grace_period_days),
            max_dunning_attempts: self.max_dunning_attempts,
            grace_warning_window: chrono::Duration::hours(self.grace_warning_window_hours),
            pro_price_ids: self.pro_price_ids.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: chrono::Duration::seconds(self.retry_backoff_base_secs),
            cap: chrono::Duration::seconds(self.retry_backoff_cap_secs),
            jitter: self.retry_backoff_jitter,
            max_retries: self.max_processing_retries,
        }
    }

    pub fn signature_verifier(&self) -> SignatureVerifier {
        SignatureVerifier::new(self.webhook_secrets.clone(), self.replay_tolerance_secs)
    }

    pub fn processing_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.processing_timeout_ms)
    }

    pub fn claim_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retry_claim_lease_secs)
    }
}

pub struct AppConfig {
    pub database_url: SecretString,
    pub database_max_connections: u32,
    pub bind_addr: SocketAddr,
    /// Bearer token for the `/internal` operator API.
    pub admin_api_token: SecretString,
    /// Messaging service endpoint. Notices are only logged when unset.
    pub notifier_url: Option<Url>,
    pub run_migrations: bool,
    /// Adds a JSON log file next to the console output when set.
    pub log_file: Option<String>,
    pub billing: BillingConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, InfraError> {
        let database_url = SecretString::new(required_env("DATABASE_URL")?.into());
        let admin_api_token = SecretString::new(required_env("ADMIN_API_TOKEN")?.into());
        let bind_addr: SocketAddr = optional_env("BIND_ADDR")?
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 3001)));
        let notifier_url: Option<Url> = optional_env("NOTIFIER_URL")?;
        let log_file: Option<String> = optional_env("LOG_FILE")?;

        Ok(Self {
            database_url,
            database_max_connections: get_env_default("DATABASE_MAX_CONNECTIONS", 5),
            bind_addr,
            admin_api_token,
            notifier_url,
            run_migrations: get_env_default("RUN_MIGRATIONS", false),
            log_file,
            billing: BillingConfig::from_env()?,
        })
    }
}
