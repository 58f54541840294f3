use crate::circuit_breaker::BreakerConfig;
use crate::config_validator::ConfigValidator;
use crate::error::ConfigError;
use crate::rate_limit_config::PolicyRegistry;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_KEY_PREFIX: &str = "quotaguard";
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_LOG_LEVEL: &str = "info";

/// Process configuration. Every flag can also be set through its environment
/// variable (a `.env` file is honoured by `main`).
#[derive(Debug, Clone, Parser)]
#[command(name = "quotaguard", version, about)]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = DEFAULT_BIND_ADDR)]
    pub bind_addr: String,

    /// Redis connection URL; empty runs with process-local counters only
    #[arg(long, env = "REDIS_URL", default_value = "")]
    pub redis_url: String,

    /// Namespace for every counter key in Redis
    #[arg(long, env = "REDIS_KEY_PREFIX", default_value = DEFAULT_KEY_PREFIX)]
    pub redis_key_prefix: String,

    /// JSON array of policy registrations; built-in defaults when unset
    #[arg(long, env = "POLICY_FILE")]
    pub policy_file: Option<PathBuf>,

    #[arg(long, env = "BREAKER_VOLUME_THRESHOLD", default_value_t = 10)]
    pub breaker_volume_threshold: u64,

    #[arg(long, env = "BREAKER_ERROR_THRESHOLD_PERCENT", default_value_t = 50.0)]
    pub breaker_error_threshold_percent: f64,

    #[arg(long, env = "BREAKER_ROLLING_WINDOW_MS", default_value_t = 10_000)]
    pub breaker_rolling_window_ms: u64,

    #[arg(long, env = "BREAKER_RESET_TIMEOUT_MS", default_value_t = 30_000)]
    pub breaker_reset_timeout_ms: u64,

    #[arg(long, env = "BREAKER_HALF_OPEN_TRIALS", default_value_t = 1)]
    pub breaker_half_open_trials: usize,

    /// Hard timeout on every shared store call
    #[arg(long, env = "STORE_CALL_TIMEOUT_MS", default_value_t = 250)]
    pub store_call_timeout_ms: u64,

    /// How often expired local counters are dropped
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value_t = DEFAULT_SWEEP_INTERVAL_SECS)]
    pub sweep_interval_secs: u64,

    #[arg(long, env = "LOG_LEVEL", default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,
}

impl Config {
    /// Command line flags, falling back to the environment.
    pub fn load() -> Result<Self, clap::Error> {
        Self::try_parse()
    }

    pub fn redis_url(&self) -> Option<&str> {
        Some(self.redis_url.trim()).filter(|url| !url.is_empty())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            volume_threshold: self.breaker_volume_threshold,
            error_threshold_percent: self.breaker_error_threshold_percent,
            rolling_window: Duration::from_millis(self.breaker_rolling_window_ms),
            reset_timeout: Duration::from_millis(self.breaker_reset_timeout_ms),
            half_open_trials: self.breaker_half_open_trials,
            call_timeout: Duration::from_millis(self.store_call_timeout_ms),
            ..BreakerConfig::default()
        }
    }

    pub fn load_policies(&self) -> Result<PolicyRegistry, ConfigError> {
        match &self.policy_file {
            Some(path) => PolicyRegistry::from_file(path),
            None => Ok(PolicyRegistry::defaults()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigValidator::validate_bind_address(&self.bind_addr)?;
        if let Some(url) = self.redis_url() {
            ConfigValidator::validate_redis_url(url)?;
        }
        ConfigValidator::validate_key_prefix(&self.redis_key_prefix)?;
        ConfigValidator::validate_sweep_interval(self.sweep_interval_secs)?;
        self.breaker_config().validate()
    }
}

impl Default for Config {
    fn default() -> Self {
        let breaker = BreakerConfig::default();
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            redis_url: String::new(),
            redis_key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            policy_file: None,
            breaker_volume_threshold: breaker.volume_threshold,
            breaker_error_threshold_percent: breaker.error_threshold_percent,
            breaker_rolling_window_ms: breaker.rolling_window.as_millis() as u64,
            breaker_reset_timeout_ms: breaker.reset_timeout.as_millis() as u64,
            breaker_half_open_trials: breaker.half_open_trials,
            store_call_timeout_ms: breaker.call_timeout.as_millis() as u64,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}
