use secrecy::Secret;
use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::time::Duration;

const DEFAULT_MAX_WORKERS: usize = 10;
const DEFAULT_JOB_QUEUE_SIZE: usize = 100;
const DEFAULT_PAYMENT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_WEBHOOK_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_DELAY_MIN_MS: u64 = 1_000;
const DEFAULT_DELAY_MAX_MS: u64 = 5_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
const DEFAULT_POLL_MAX_ATTEMPTS: u32 = 30;
const DEFAULT_RETRY_WINDOW_MS: u64 = 30_000;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    #[serde(default)]
    pub server: core_config::Config,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Currency used for payouts.
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

fn default_currency() -> String {
    "IDR".to_string()
}

fn default_service_name() -> String {
    "payment-pipeline".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: core_config::Config::default(),
            gateway: GatewayConfig::default(),
            database: DatabaseConfig::default(),
            currency: default_currency(),
            service_name: default_service_name(),
        }
    }
}

impl Config {
    /// Load from `configuration.*` and `APP__*` environment variables,
    /// e.g. `APP__GATEWAY__MAX_WORKERS=20`.
    pub fn load() -> Result<Self, AppError> {
        let mut config: Config = core_config::load("APP")?;
        config.gateway = config.gateway.normalized();
        Ok(config)
    }
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    #[default]
    Memory,
    Mongo,
}

#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: DatabaseBackend,
    #[serde(default = "default_database_url")]
    pub url: Secret<String>,
    #[serde(default = "default_database_name")]
    pub db_name: String,
}

fn default_database_url() -> Secret<String> {
    Secret::new("mongodb://localhost:27017".to_string())
}

fn default_database_name() -> String {
    "payment_pipeline".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::default(),
            url: default_database_url(),
            db_name: default_database_name(),
        }
    }
}

/// How a worker learns the terminal state of a payment.
#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeMode {
    /// Random outcome after a random delay. Stand-in for a real gateway.
    #[default]
    Simulated,
    /// Poll the gateway's payment status until it settles.
    Poll,
}

/// Settings for the gateway worker pool. Zero means "use the default";
/// call [`GatewayConfig::normalized`] before use.
#[derive(Deserialize, Clone, Debug)]
pub struct GatewayConfig {
    /// Gateway API root. Without it, initiation is skipped and ids are simulated.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "empty_secret")]
    pub api_key: Secret<String>,
    #[serde(default = "default_initiate_path")]
    pub initiate_path: String,
    /// Where workers deliver payment results. Defaults to this service's own
    /// webhook endpoint at startup.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Shared secret for signing/verifying webhook bodies.
    #[serde(default)]
    pub webhook_secret: Option<Secret<String>>,
    #[serde(default)]
    pub max_workers: usize,
    #[serde(default)]
    pub job_queue_size: usize,
    #[serde(default)]
    pub worker_pool_size: usize,
    #[serde(default)]
    pub payment_timeout_ms: u64,
    #[serde(default)]
    pub webhook_timeout_ms: u64,
    #[serde(default)]
    pub outcome: OutcomeMode,
    #[serde(default = "default_success_rate")]
    pub simulated_success_rate: f64,
    #[serde(default)]
    pub simulated_delay_min_ms: u64,
    #[serde(default)]
    pub simulated_delay_max_ms: u64,
    #[serde(default)]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub poll_max_attempts: u32,
    /// Upper bound on time spent retrying initiation or webhook delivery.
    #[serde(default)]
    pub retry_window_ms: u64,
}

fn empty_secret() -> Secret<String> {
    Secret::new(String::new())
}

fn default_initiate_path() -> String {
    "/v1/payments".to_string()
}

fn default_success_rate() -> f64 {
    0.8
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: empty_secret(),
            initiate_path: default_initiate_path(),
            webhook_url: None,
            webhook_secret: None,
            max_workers: 0,
            job_queue_size: 0,
            worker_pool_size: 0,
            payment_timeout_ms: 0,
            webhook_timeout_ms: 0,
            outcome: OutcomeMode::default(),
            simulated_success_rate: default_success_rate(),
            simulated_delay_min_ms: 0,
            simulated_delay_max_ms: 0,
            poll_interval_ms: 0,
            poll_max_attempts: 0,
            retry_window_ms: 0,
        }
    }
}

fn or_default<T: PartialEq + Default>(value: T, default: T) -> T {
    if value == T::default() {
        default
    } else {
        value
    }
}

impl GatewayConfig {
    pub fn normalized(mut self) -> Self {
        self.max_workers = or_default(self.max_workers, DEFAULT_MAX_WORKERS);
        self.job_queue_size = or_default(self.job_queue_size, DEFAULT_JOB_QUEUE_SIZE);
        self.worker_pool_size = or_default(self.worker_pool_size, self.max_workers);
        self.payment_timeout_ms = or_default(self.payment_timeout_ms, DEFAULT_PAYMENT_TIMEOUT_MS);
        self.webhook_timeout_ms = or_default(self.webhook_timeout_ms, DEFAULT_WEBHOOK_TIMEOUT_MS);
        self.poll_interval_ms = or_default(self.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        self.poll_max_attempts = or_default(self.poll_max_attempts, DEFAULT_POLL_MAX_ATTEMPTS);
        self.retry_window_ms = or_default(self.retry_window_ms, DEFAULT_RETRY_WINDOW_MS);

        if self.simulated_delay_min_ms == 0 && self.simulated_delay_max_ms == 0 {
            self.simulated_delay_min_ms = DEFAULT_DELAY_MIN_MS;
            self.simulated_delay_max_ms = DEFAULT_DELAY_MAX_MS;
        }
        if self.simulated_delay_max_ms < self.simulated_delay_min_ms {
            self.simulated_delay_max_ms = self.simulated_delay_min_ms;
        }
        if !(0.0..=1.0).contains(&self.simulated_success_rate) {
            self.simulated_success_rate = default_success_rate();
        }
        self.base_url = self
            .base_url
            .map(|url| url.trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());

        self
    }

    pub fn payment_timeout(&self) -> Duration {
        Duration::from_millis(self.payment_timeout_ms)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_millis(self.webhook_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_window(&self) -> Duration {
        Duration::from_millis(self.retry_window_ms)
    }
}
