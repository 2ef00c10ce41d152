//! Service configuration.

use std::time::Duration;

use ledgerflow_ledger::{EngineConfig, PgLedgerConfig};

/// Retry configuration for storage conflicts.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Backoff before the first retry; doubles on each further retry.
    pub backoff_base: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base: Duration::from_millis(20),
        }
    }
}

/// Main service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Database URL.
    pub database_url: String,
    /// Engine configuration.
    pub engine: EngineConfig,
    /// PostgreSQL adapter configuration.
    pub postgres: PgLedgerConfig,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Log level used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/ledgerflow".to_string(),
            engine: EngineConfig::default(),
            postgres: PgLedgerConfig::default(),
            retry: RetryConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

fn millis(value: Option<String>) -> Option<Duration> {
    value?.parse().ok().map(Duration::from_millis)
}

impl ServiceConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key/value source. Unparseable values keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("DATABASE_URL") {
            config.database_url = url;
        }

        if let Some(max) = lookup("DATABASE_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            config.postgres.max_connections = max;
        }

        if let Some(timeout) = millis(lookup("TRANSFER_TIMEOUT_MS")) {
            config.engine.transfer_timeout = timeout;
            config.postgres.statement_timeout = timeout;
        }

        if let Some(timeout) = millis(lookup("LOCK_TIMEOUT_MS")) {
            config.postgres.lock_timeout = timeout;
        }

        if let Some(retries) = lookup("TRANSFER_MAX_RETRIES").and_then(|v| v.parse().ok()) {
            config.retry.max_retries = retries;
        }

        if let Some(backoff) = millis(lookup("TRANSFER_RETRY_BACKOFF_MS")) {
            config.retry.backoff_base = backoff;
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.database_url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }

        if self.postgres.max_connections == 0 {
            return Err("Database pool needs at least one connection".to_string());
        }

        if self.engine.transfer_timeout.is_zero() {
            return Err("Transfer timeout cannot be 0".to_string());
        }

        if self.postgres.lock_timeout.is_zero() {
            return Err("Lock timeout cannot be 0".to_string());
        }

        // A lock wait must end before the transfer deadline does.
        if self.postgres.lock_timeout >= self.engine.transfer_timeout {
            return Err("Lock timeout must be shorter than the transfer timeout".to_string());
        }

        if self.retry.max_retries > 10 {
            return Err("At most 10 retries are allowed".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_retries, 2);
    }

    #[test]
    fn test_env_overrides() {
        let config = ServiceConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/ledger"),
            ("DATABASE_MAX_CONNECTIONS", "32"),
            ("TRANSFER_TIMEOUT_MS", "3000"),
            ("LOCK_TIMEOUT_MS", "1000"),
            ("TRANSFER_MAX_RETRIES", "1"),
            ("LOG_LEVEL", "debug"),
        ]));

        assert_eq!(config.database_url, "postgres://db/ledger");
        assert_eq!(config.postgres.max_connections, 32);
        assert_eq!(config.engine.transfer_timeout, Duration::from_secs(3));
        assert_eq!(config.postgres.lock_timeout, Duration::from_secs(1));
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.log_level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unparseable_values_keep_defaults() {
        let config = ServiceConfig::from_lookup(lookup(&[
            ("TRANSFER_TIMEOUT_MS", "soon"),
            ("TRANSFER_MAX_RETRIES", "-1"),
        ]));
        assert_eq!(config.engine.transfer_timeout, EngineConfig::default().transfer_timeout);
        assert_eq!(config.retry.max_retries, 2);
    }

    #[test]
    fn test_invalid_config() {
        let mut config = ServiceConfig::default();
        config.postgres.lock_timeout = config.engine.transfer_timeout;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.database_url.clear();
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.postgres.max_connections = 0;
        assert!(config.validate().is_err());
    }
}
