//! Configuration management for the cartback service.

use std::{fmt, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use cartback_recovery::{
    LifecycleConfig, MailerConfig, ReminderTemplate, SchedulerConfig, VerificationRetryPolicy,
    VerifierConfig,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};

const CONFIG_FILE: &str = "config.toml";

/// Upper bound for every configured delay (ten years).
const MAX_DELAY_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`config.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// Only `RESEND_API_KEY` has no usable default; without it reminder sends
/// fail and are logged.
///
/// # Example
///
/// ```no_run
/// use cartback_api::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
///
/// println!("Server will bind to {}:{}", config.host, config.port);
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,
    /// Database connection acquire timeout in seconds.
    ///
    /// Environment variable: `DATABASE_CONNECTION_TIMEOUT`
    #[serde(default = "default_acquire_timeout", alias = "DATABASE_CONNECTION_TIMEOUT")]
    pub database_connection_timeout: u64,

    // Server
    /// Server bind address.
    ///
    /// Environment variable: `HOST`
    #[serde(default = "default_host", alias = "HOST")]
    pub host: String,
    /// Server bind port.
    ///
    /// Environment variable: `PORT`
    #[serde(default = "default_port", alias = "PORT")]
    pub port: u16,
    /// HTTP request timeout in seconds.
    ///
    /// Environment variable: `REQUEST_TIMEOUT`
    #[serde(default = "default_request_timeout", alias = "REQUEST_TIMEOUT")]
    pub request_timeout: u64,

    // Lifecycle
    /// Delay between capture and the purchase check, in seconds.
    ///
    /// Environment variable: `VERIFICATION_DELAY_SECONDS`
    #[serde(default = "default_verification_delay", alias = "VERIFICATION_DELAY_SECONDS")]
    pub verification_delay_seconds: u64,
    /// Reminder offsets from the start of recovery, in seconds. One entry
    /// per reminder. Accepts a list or a comma-separated string.
    ///
    /// Environment variable: `REMINDER_DELAYS_SECONDS`
    #[serde(
        default = "default_reminder_delays",
        alias = "REMINDER_DELAYS_SECONDS",
        deserialize_with = "delays_from_list_or_csv"
    )]
    pub reminder_delays_seconds: Vec<u64>,

    // Verification retry
    /// Maximum purchase checks before giving up on a lead.
    ///
    /// Environment variable: `VERIFICATION_MAX_ATTEMPTS`
    #[serde(default = "default_verification_attempts", alias = "VERIFICATION_MAX_ATTEMPTS")]
    pub verification_max_attempts: u32,
    /// Base delay for verifier retry backoff in seconds.
    ///
    /// Environment variable: `VERIFICATION_RETRY_BASE_DELAY_SECONDS`
    #[serde(
        default = "default_retry_base_delay",
        alias = "VERIFICATION_RETRY_BASE_DELAY_SECONDS"
    )]
    pub verification_retry_base_delay_seconds: u64,
    /// Maximum delay between verifier retries in seconds.
    ///
    /// Environment variable: `VERIFICATION_RETRY_MAX_DELAY_SECONDS`
    #[serde(
        default = "default_retry_max_delay",
        alias = "VERIFICATION_RETRY_MAX_DELAY_SECONDS"
    )]
    pub verification_retry_max_delay_seconds: u64,
    /// Jitter factor for retry timing (0.0 to 1.0).
    ///
    /// Environment variable: `VERIFICATION_RETRY_JITTER_FACTOR`
    #[serde(default = "default_jitter_factor", alias = "VERIFICATION_RETRY_JITTER_FACTOR")]
    pub verification_retry_jitter_factor: f64,

    // Verifier
    /// Purchase lookup endpoint.
    ///
    /// Environment variable: `VERIFIER_URL`
    #[serde(default = "default_verifier_url", alias = "VERIFIER_URL")]
    pub verifier_url: String,
    /// Bearer token for the purchase lookup.
    ///
    /// Environment variable: `VERIFIER_API_TOKEN`
    #[serde(default, alias = "VERIFIER_API_TOKEN")]
    pub verifier_api_token: Option<String>,
    /// Purchase lookup timeout in seconds.
    ///
    /// Environment variable: `VERIFIER_TIMEOUT_SECONDS`
    #[serde(default = "default_client_timeout", alias = "VERIFIER_TIMEOUT_SECONDS")]
    pub verifier_timeout_seconds: u64,

    // Mailer
    /// Email API endpoint.
    ///
    /// Environment variable: `MAILER_URL`
    #[serde(default = "default_mailer_url", alias = "MAILER_URL")]
    pub mailer_url: String,
    /// Resend API key.
    ///
    /// Environment variable: `RESEND_API_KEY`
    #[serde(default, alias = "RESEND_API_KEY")]
    pub resend_api_key: String,
    /// Sender address for reminders.
    ///
    /// Environment variable: `MAILER_FROM`
    #[serde(default = "default_mailer_from", alias = "MAILER_FROM")]
    pub mailer_from: String,
    /// Email API timeout in seconds.
    ///
    /// Environment variable: `MAILER_TIMEOUT_SECONDS`
    #[serde(default = "default_client_timeout", alias = "MAILER_TIMEOUT_SECONDS")]
    pub mailer_timeout_seconds: u64,

    // Scheduler
    /// Number of concurrent scheduler workers.
    ///
    /// Environment variable: `SCHEDULER_WORKERS`
    #[serde(default = "default_worker_count", alias = "SCHEDULER_WORKERS")]
    pub scheduler_workers: usize,
    /// Maximum actions claimed per worker poll.
    ///
    /// Environment variable: `SCHEDULER_BATCH_SIZE`
    #[serde(default = "default_batch_size", alias = "SCHEDULER_BATCH_SIZE")]
    pub scheduler_batch_size: usize,
    /// Idle poll interval in milliseconds.
    ///
    /// Environment variable: `SCHEDULER_POLL_INTERVAL_MS`
    #[serde(default = "default_poll_interval_ms", alias = "SCHEDULER_POLL_INTERVAL_MS")]
    pub scheduler_poll_interval_ms: u64,
    /// Seconds before a claimed action is considered abandoned.
    ///
    /// Environment variable: `SCHEDULER_LEASE_TIMEOUT_SECONDS`
    #[serde(default = "default_lease_timeout", alias = "SCHEDULER_LEASE_TIMEOUT_SECONDS")]
    pub scheduler_lease_timeout_seconds: u64,
}

impl Config {
    /// Load configuration from defaults, config file, and environment variable
    /// overrides.
    ///
    /// # Errors
    ///
    /// Fails when a source cannot be parsed or a value is out of range.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Convert to the lifecycle engine's configuration.
    pub fn to_lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            verification_delay: Duration::from_secs(self.verification_delay_seconds),
            reminder_delays: self
                .reminder_delays_seconds
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            templates: ReminderTemplate::default_sequence(),
            retry_policy: self.to_retry_policy(),
        }
    }

    /// Convert to the verifier retry policy.
    pub fn to_retry_policy(&self) -> VerificationRetryPolicy {
        VerificationRetryPolicy {
            max_attempts: self.verification_max_attempts,
            base_delay: Duration::from_secs(self.verification_retry_base_delay_seconds),
            max_delay: Duration::from_secs(self.verification_retry_max_delay_seconds),
            jitter_factor: self.verification_retry_jitter_factor,
        }
    }

    /// Convert to scheduler configuration.
    ///
    /// Error backoff and shutdown timeout are fixed.
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            worker_count: self.scheduler_workers,
            batch_size: self.scheduler_batch_size,
            poll_interval: Duration::from_millis(self.scheduler_poll_interval_ms),
            lease_timeout: Duration::from_secs(self.scheduler_lease_timeout_seconds),
            ..SchedulerConfig::default()
        }
    }

    /// Convert to purchase verifier client configuration.
    pub fn to_verifier_config(&self) -> VerifierConfig {
        VerifierConfig {
            url: self.verifier_url.clone(),
            api_token: self.verifier_api_token.clone().filter(|t| !t.is_empty()),
            timeout: Duration::from_secs(self.verifier_timeout_seconds),
            ..VerifierConfig::default()
        }
    }

    /// Convert to mailer client configuration.
    pub fn to_mailer_config(&self) -> MailerConfig {
        MailerConfig {
            url: self.mailer_url.clone(),
            api_key: self.resend_api_key.clone(),
            from: self.mailer_from.clone(),
            timeout: Duration::from_secs(self.mailer_timeout_seconds),
        }
    }

    /// Parse server socket address from host and port configuration.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("Invalid server address")
    }

    /// HTTP request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                let mut masked = self.database_url.clone();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }

        if self.database_max_connections == 0 {
            anyhow::bail!("database max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database min_connections cannot exceed max_connections");
        }

        if self.reminder_delays_seconds.is_empty() {
            anyhow::bail!("reminder_delays_seconds must contain at least one delay");
        }

        let delays = [
            ("verification_delay_seconds", self.verification_delay_seconds),
            ("verification_retry_base_delay_seconds", self.verification_retry_base_delay_seconds),
            ("verification_retry_max_delay_seconds", self.verification_retry_max_delay_seconds),
        ];
        for (name, seconds) in delays {
            if seconds > MAX_DELAY_SECONDS {
                anyhow::bail!("{name} must not exceed {MAX_DELAY_SECONDS}");
            }
        }

        if self.reminder_delays_seconds.iter().any(|s| *s > MAX_DELAY_SECONDS) {
            anyhow::bail!("reminder_delays_seconds entries must not exceed {MAX_DELAY_SECONDS}");
        }

        if self.scheduler_workers == 0 {
            anyhow::bail!("scheduler_workers must be greater than 0");
        }

        if self.scheduler_batch_size == 0 {
            anyhow::bail!("scheduler_batch_size must be greater than 0");
        }

        if self.verification_max_attempts == 0 {
            anyhow::bail!("verification_max_attempts must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.verification_retry_jitter_factor) {
            anyhow::bail!("verification_retry_jitter_factor must be between 0.0 and 1.0");
        }

        for (name, url) in [("verifier_url", &self.verifier_url), ("mailer_url", &self.mailer_url)] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                anyhow::bail!("{name} must be an http(s) URL");
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
            verification_delay_seconds: default_verification_delay(),
            reminder_delays_seconds: default_reminder_delays(),
            verification_max_attempts: default_verification_attempts(),
            verification_retry_base_delay_seconds: default_retry_base_delay(),
            verification_retry_max_delay_seconds: default_retry_max_delay(),
            verification_retry_jitter_factor: default_jitter_factor(),
            verifier_url: default_verifier_url(),
            verifier_api_token: None,
            verifier_timeout_seconds: default_client_timeout(),
            mailer_url: default_mailer_url(),
            resend_api_key: String::new(),
            mailer_from: default_mailer_from(),
            mailer_timeout_seconds: default_client_timeout(),
            scheduler_workers: default_worker_count(),
            scheduler_batch_size: default_batch_size(),
            scheduler_poll_interval_ms: default_poll_interval_ms(),
            scheduler_lease_timeout_seconds: default_lease_timeout(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &self.database_url_masked())
            .field("host", &self.host)
            .field("port", &self.port)
            .field("verification_delay_seconds", &self.verification_delay_seconds)
            .field("reminder_delays_seconds", &self.reminder_delays_seconds)
            .field("verifier_url", &self.verifier_url)
            .field("verifier_api_token", &self.verifier_api_token.as_deref().map(mask_secret))
            .field("mailer_url", &self.mailer_url)
            .field("resend_api_key", &mask_secret(&self.resend_api_key))
            .field("mailer_from", &self.mailer_from)
            .field("scheduler_workers", &self.scheduler_workers)
            .finish_non_exhaustive()
    }
}

fn mask_secret(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<unset>"
    } else {
        "***"
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DelayList {
    List(Vec<u64>),
    Single(u64),
    Csv(String),
}

fn delays_from_list_or_csv<'de, D>(deserializer: D) -> std::result::Result<Vec<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match DelayList::deserialize(deserializer)? {
        DelayList::List(delays) => Ok(delays),
        DelayList::Single(delay) => Ok(vec![delay]),
        DelayList::Csv(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<u64>().map_err(|e| {
                    serde::de::Error::custom(format!("invalid reminder delay {part:?}: {e}"))
                })
            })
            .collect(),
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/cartback".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_request_timeout() -> u64 {
    30
}

fn default_verification_delay() -> u64 {
    20 * 60
}

fn default_reminder_delays() -> Vec<u64> {
    vec![0, 24 * 60 * 60, 3 * 24 * 60 * 60]
}

fn default_verification_attempts() -> u32 {
    5
}

fn default_retry_base_delay() -> u64 {
    60
}

fn default_retry_max_delay() -> u64 {
    3600
}

fn default_jitter_factor() -> f64 {
    0.1
}

fn default_verifier_url() -> String {
    VerifierConfig::default().url
}

fn default_client_timeout() -> u64 {
    10
}

fn default_mailer_url() -> String {
    MailerConfig::default().url
}

fn default_mailer_from() -> String {
    MailerConfig::default().from
}

fn default_worker_count() -> usize {
    cartback_recovery::DEFAULT_WORKER_COUNT
}

fn default_batch_size() -> usize {
    cartback_recovery::DEFAULT_BATCH_SIZE
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_lease_timeout() -> u64 {
    300
}
