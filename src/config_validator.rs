use crate::error::ConfigError;
use std::net::SocketAddr;

/// Validates configuration values for consistency and correctness
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates a Redis URL
    pub fn validate_redis_url(url: &str) -> Result<(), ConfigError> {
        if url.is_empty() {
            return Err(ConfigError::Invalid("Redis URL cannot be empty".to_string()));
        }

        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(ConfigError::Invalid(
                "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates a bind address
    pub fn validate_bind_address(address: &str) -> Result<(), ConfigError> {
        if address.is_empty() {
            return Err(ConfigError::Invalid("Bind address cannot be empty".to_string()));
        }

        if !address.contains(':') {
            return Err(ConfigError::Invalid(
                "Bind address must be in host:port format".to_string(),
            ));
        }

        address.parse::<SocketAddr>().map_err(|e| {
            ConfigError::Invalid(format!("Bind address '{address}' is not valid: {e}"))
        })?;

        Ok(())
    }

    /// Redis key prefixes end up in every key and in the SCAN pattern.
    pub fn validate_key_prefix(prefix: &str) -> Result<(), ConfigError> {
        if prefix.is_empty() {
            return Err(ConfigError::Invalid("Redis key prefix cannot be empty".to_string()));
        }

        if prefix
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '*' | '?' | '[' | ']'))
        {
            return Err(ConfigError::Invalid(format!(
                "Redis key prefix '{prefix}' cannot contain whitespace or glob characters"
            )));
        }

        Ok(())
    }

    pub fn validate_sweep_interval(secs: u64) -> Result<(), ConfigError> {
        if secs == 0 {
            return Err(ConfigError::Invalid(
                "Sweep interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
