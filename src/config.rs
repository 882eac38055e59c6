// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::constants::{leader, rollout, DEFAULT_NAMESPACE, DEFAULT_WORKERS, OPERATOR_NAME};
use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Operator configuration loaded once at startup and passed to every component
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace the operator runs in and deploys the controller to
    pub namespace: String,
    /// Component name, used for the lease and the work queue key
    pub name: String,
    /// Identity written into the leader lease
    pub identity: String,
    /// Number of concurrent reconcile workers
    pub workers: usize,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
    pub rollout_timeout: Duration,
    pub rollout_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            namespace: DEFAULT_NAMESPACE.to_string(),
            name: OPERATOR_NAME.to_string(),
            identity: format!("{}-{}", OPERATOR_NAME, std::process::id()),
            workers: DEFAULT_WORKERS,
            lease_duration: Duration::from_secs(leader::LEASE_DURATION_SECS),
            renew_deadline: Duration::from_secs(leader::RENEW_DEADLINE_SECS),
            retry_period: Duration::from_secs(leader::RETRY_PERIOD_SECS),
            rollout_timeout: Duration::from_secs(rollout::TIMEOUT_SECS),
            rollout_poll_interval: Duration::from_secs(rollout::POLL_INTERVAL_SECS),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let namespace = env::var("COMPONENT_NAMESPACE").unwrap_or(defaults.namespace);
        let name = env::var("COMPONENT_NAME").unwrap_or(defaults.name);
        let identity = env::var("POD_NAME")
            .or_else(|_| env::var("HOSTNAME"))
            .unwrap_or(defaults.identity);

        let workers: usize = parse_var("WORKERS")?.unwrap_or(defaults.workers);
        if workers == 0 {
            anyhow::bail!("WORKERS must be at least 1");
        }

        Ok(Config {
            namespace,
            name,
            identity,
            workers,
            lease_duration: secs_var("LEASE_DURATION_SECS")?.unwrap_or(defaults.lease_duration),
            renew_deadline: secs_var("RENEW_DEADLINE_SECS")?.unwrap_or(defaults.renew_deadline),
            retry_period: secs_var("RETRY_PERIOD_SECS")?.unwrap_or(defaults.retry_period),
            rollout_timeout: secs_var("ROLLOUT_TIMEOUT_SECS")?.unwrap_or(defaults.rollout_timeout),
            rollout_poll_interval: secs_var("ROLLOUT_POLL_INTERVAL_SECS")?
                .unwrap_or(defaults.rollout_poll_interval),
        })
    }

    /// The single work queue key every watch event maps to
    pub fn work_queue_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

fn parse_var<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .with_context(|| format!("{} has an invalid value: {}", key, raw)),
        Err(_) => Ok(None),
    }
}

fn secs_var(key: &str) -> Result<Option<Duration>> {
    Ok(parse_var::<u64>(key)?.map(Duration::from_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timings() {
        let config = Config::default();
        assert_eq!(config.workers, 2);
        assert_eq!(config.rollout_timeout, Duration::from_secs(300));
        assert_eq!(config.rollout_poll_interval, Duration::from_secs(1));
        assert!(config.lease_duration > config.renew_deadline);
    }

    #[test]
    fn test_work_queue_key() {
        let config = Config {
            namespace: "test-namespace".to_string(),
            name: "mhc-operator".to_string(),
            ..Default::default()
        };
        assert_eq!(config.work_queue_key(), "test-namespace/mhc-operator");
    }
}
