//! Process configuration: the enumerated keys, loaded from the environment
//! with documented defaults. Constructed once at startup and passed by
//! reference or `Arc` into whatever needs it — no process-wide default.

use std::time::Duration;

use crate::bus::DlqPolicy;
use crate::replay::ReplayPolicy;

/// Log output shape, read by [`crate::logging::init_logging`].
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: String,
    pub log_file: String,
    /// `"hourly" | "daily" | anything else (never rotates)`.
    pub rotation: String,
    pub log_level: String,
    pub use_json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            log_file: "tradebus.log".to_string(),
            rotation: "daily".to_string(),
            log_level: "info".to_string(),
            use_json: false,
        }
    }
}

/// Every configuration key this crate reads, enumerated.
#[derive(Debug, Clone)]
pub struct Config {
    pub store_url_compute: String,
    pub store_url_trade: String,
    pub idempotency_ttl: Duration,
    pub handler_timeout: Duration,
    pub max_attempts: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_factor: u32,
    pub retry_backoff_cap: Duration,
    pub worker_concurrency: usize,
    pub reconcile_period: Duration,
    pub lease_ttl: Duration,
    pub replay_mode: ReplayPolicy,
    pub bridge_whitelist: Vec<String>,
    pub dlq_policy: DlqPolicy,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_url_compute: "memory://compute".to_string(),
            store_url_trade: "memory://trade".to_string(),
            idempotency_ttl: Duration::from_secs(604_800),
            handler_timeout: Duration::from_secs(30),
            max_attempts: 5,
            retry_backoff_base: Duration::from_secs(1),
            retry_backoff_factor: 2,
            retry_backoff_cap: Duration::from_secs(60),
            worker_concurrency: 4,
            reconcile_period: Duration::from_millis(30_000),
            lease_ttl: Duration::from_millis(10_000),
            replay_mode: ReplayPolicy::SkipInvalid,
            bridge_whitelist: vec!["risk.order.approved.v1".to_string()],
            dlq_policy: DlqPolicy::Enabled,
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Reads every key from the environment, falling back to the default
    /// for anything unset or unparseable. A non-default `bridge_whitelist`
    /// override is expected to be logged by the caller on startup.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            store_url_compute: env_or("TRADEBUS_STORE_URL_COMPUTE", defaults.store_url_compute),
            store_url_trade: env_or("TRADEBUS_STORE_URL_TRADE", defaults.store_url_trade),
            idempotency_ttl: env_secs("TRADEBUS_IDEMPOTENCY_TTL", defaults.idempotency_ttl),
            handler_timeout: env_secs("TRADEBUS_HANDLER_TIMEOUT", defaults.handler_timeout),
            max_attempts: env_u32("TRADEBUS_MAX_ATTEMPTS", defaults.max_attempts),
            retry_backoff_base: env_millis("TRADEBUS_RETRY_BACKOFF_BASE_MS", defaults.retry_backoff_base),
            retry_backoff_factor: env_u32("TRADEBUS_RETRY_BACKOFF_FACTOR", defaults.retry_backoff_factor),
            retry_backoff_cap: env_millis("TRADEBUS_RETRY_BACKOFF_CAP_MS", defaults.retry_backoff_cap),
            worker_concurrency: env_u32("TRADEBUS_WORKER_CONCURRENCY", defaults.worker_concurrency as u32) as usize,
            reconcile_period: env_millis("TRADEBUS_RECONCILE_PERIOD_MS", defaults.reconcile_period),
            lease_ttl: env_millis("TRADEBUS_LEASE_TTL_MS", defaults.lease_ttl),
            replay_mode: std::env::var("TRADEBUS_REPLAY_MODE")
                .ok()
                .and_then(|s| ReplayPolicy::from_config_str(&s))
                .unwrap_or(defaults.replay_mode),
            bridge_whitelist: std::env::var("TRADEBUS_BRIDGE_WHITELIST")
                .ok()
                .map(|s| s.split(',').map(str::trim).map(str::to_string).filter(|s| !s.is_empty()).collect())
                .unwrap_or(defaults.bridge_whitelist),
            dlq_policy: defaults.dlq_policy,
            logging: LoggingConfig {
                log_dir: env_or("TRADEBUS_LOG_DIR", defaults.logging.log_dir),
                log_file: env_or("TRADEBUS_LOG_FILE", defaults.logging.log_file),
                rotation: env_or("TRADEBUS_LOG_ROTATION", defaults.logging.rotation),
                log_level: env_or("TRADEBUS_LOG_LEVEL", defaults.logging.log_level),
                use_json: std::env::var("TRADEBUS_LOG_JSON").map(|v| v == "1" || v == "true").unwrap_or(defaults.logging.use_json),
            },
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_defaults() {
        let config = Config::default();
        assert_eq!(config.idempotency_ttl, Duration::from_secs(604_800));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.retry_backoff_base, Duration::from_secs(1));
        assert_eq!(config.retry_backoff_factor, 2);
        assert_eq!(config.retry_backoff_cap, Duration::from_secs(60));
        assert_eq!(config.reconcile_period, Duration::from_millis(30_000));
        assert_eq!(config.lease_ttl, Duration::from_millis(10_000));
        assert_eq!(config.bridge_whitelist, vec!["risk.order.approved.v1".to_string()]);
    }
}
