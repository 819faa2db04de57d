//! Retry pipeline configuration from the environment.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::retry::{RetryExecutorConfig, RetryPolicy};

pub const ENV_WORKERS: &str = "STOREFRONT_RETRY_WORKERS";
pub const ENV_MAX_ATTEMPTS: &str = "STOREFRONT_RETRY_MAX_ATTEMPTS";
pub const ENV_INITIAL_DELAY_MS: &str = "STOREFRONT_RETRY_INITIAL_DELAY_MS";
pub const ENV_MAX_DELAY_MS: &str = "STOREFRONT_RETRY_MAX_DELAY_MS";
pub const ENV_BACKOFF_MULTIPLIER: &str = "STOREFRONT_RETRY_BACKOFF_MULTIPLIER";
pub const ENV_RETENTION_DAYS: &str = "STOREFRONT_RETRY_RETENTION_DAYS";
pub const ENV_CLEANUP_INTERVAL_SECS: &str = "STOREFRONT_RETRY_CLEANUP_INTERVAL_SECS";

/// Deployment settings for the retry pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    pub workers: usize,
    pub default_policy: RetryPolicy,
    /// Failed records idle longer than this are deleted by the cleanup worker
    pub retention_days: u32,
    pub cleanup_interval: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            workers: 4,
            default_policy: RetryPolicy::default_policy(),
            retention_days: 30,
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

impl RetrySettings {
    /// Read settings from `STOREFRONT_RETRY_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`; unset keys keep their defaults and
    /// unparsable ones fall back with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let policy = &defaults.default_policy;

        let workers = parse_or(&lookup, ENV_WORKERS, defaults.workers);
        let workers = if workers == 0 {
            warn!(key = ENV_WORKERS, "worker count must be positive; using default");
            defaults.workers
        } else {
            workers
        };

        let max_attempts = parse_or(&lookup, ENV_MAX_ATTEMPTS, policy.max_attempts());
        let initial_delay_ms = parse_or(
            &lookup,
            ENV_INITIAL_DELAY_MS,
            policy.initial_delay().as_millis() as u64,
        );
        let max_delay_ms = parse_or(
            &lookup,
            ENV_MAX_DELAY_MS,
            policy.max_delay().as_millis() as u64,
        );
        let multiplier = parse_or(&lookup, ENV_BACKOFF_MULTIPLIER, policy.backoff_multiplier());

        let default_policy = match RetryPolicy::new(
            max_attempts,
            Duration::from_millis(initial_delay_ms),
            Duration::from_millis(max_delay_ms),
            multiplier,
        ) {
            Ok(policy) => policy,
            Err(e) => {
                warn!(error = %e, "configured retry policy is invalid; using default");
                defaults.default_policy.clone()
            }
        };

        let retention_days = parse_or(&lookup, ENV_RETENTION_DAYS, defaults.retention_days);
        let cleanup_secs = parse_or(
            &lookup,
            ENV_CLEANUP_INTERVAL_SECS,
            defaults.cleanup_interval.as_secs(),
        );

        Self {
            workers,
            default_policy,
            retention_days,
            cleanup_interval: Duration::from_secs(cleanup_secs.max(1)),
        }
    }

    pub fn executor_config(&self, name: impl Into<String>) -> RetryExecutorConfig {
        RetryExecutorConfig::default()
            .with_name(name)
            .with_workers(self.workers)
            .with_default_policy(self.default_policy.clone())
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Copy,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable setting");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        assert_eq!(RetrySettings::from_lookup(|_| None), RetrySettings::default());
    }

    #[test]
    fn reads_all_settings() {
        let settings = RetrySettings::from_lookup(lookup(&[
            (ENV_WORKERS, "8"),
            (ENV_MAX_ATTEMPTS, "5"),
            (ENV_INITIAL_DELAY_MS, "250"),
            (ENV_MAX_DELAY_MS, "10000"),
            (ENV_BACKOFF_MULTIPLIER, "3"),
            (ENV_RETENTION_DAYS, "7"),
            (ENV_CLEANUP_INTERVAL_SECS, "60"),
        ]));

        assert_eq!(settings.workers, 8);
        assert_eq!(settings.default_policy.max_attempts(), 5);
        assert_eq!(settings.default_policy.initial_delay(), Duration::from_millis(250));
        assert_eq!(settings.default_policy.max_delay(), Duration::from_secs(10));
        assert_eq!(settings.default_policy.backoff_multiplier(), 3.0);
        assert_eq!(settings.retention_days, 7);
        assert_eq!(settings.cleanup_interval, Duration::from_secs(60));

        let config = settings.executor_config("orders-retry");
        assert_eq!(config.name, "orders-retry");
        assert_eq!(config.workers, 8);
        assert_eq!(config.default_policy, settings.default_policy);
    }

    #[test]
    fn garbage_values_fall_back() {
        let settings = RetrySettings::from_lookup(lookup(&[
            (ENV_WORKERS, "many"),
            (ENV_RETENTION_DAYS, "-3"),
            (ENV_INITIAL_DELAY_MS, " 1500 "),
        ]));

        assert_eq!(settings.workers, 4);
        assert_eq!(settings.retention_days, 30);
        assert_eq!(settings.default_policy.initial_delay(), Duration::from_millis(1500));
    }

    #[test]
    fn invalid_policy_falls_back_to_default() {
        let settings = RetrySettings::from_lookup(lookup(&[
            (ENV_MAX_ATTEMPTS, "0"),
            (ENV_BACKOFF_MULTIPLIER, "0.5"),
        ]));
        assert_eq!(settings.default_policy, RetryPolicy::default_policy());

        let zero_workers = RetrySettings::from_lookup(lookup(&[(ENV_WORKERS, "0")]));
        assert_eq!(zero_workers.workers, 4);
    }
}
