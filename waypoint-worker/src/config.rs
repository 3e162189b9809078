//! Worker configuration module
//!
//! Loads and validates the worker configuration from environment variables.
//!
//! Environment variables:
//! - `DATABASE_URL`: PostgreSQL connection string (required)
//! - `REDIS_URL`: control-plane redis, ideally a database index of its own (required)
//! - `WAYPOINT_ADMIN_KEY`: shared key for the admin API (required)
//! - `WAYPOINT_FETCHER_URL`: base URL of the section fetcher service (required)
//! - `WAYPOINT_CONTROL_PREFIX`: key prefix of the control plane (default: waypoint)
//! - `PORT`: HTTP port (default: 8080)
//! - `WAYPOINT_FETCHER_TIMEOUT_SECS`: per-call fetcher timeout (default: 120)
//! - `WAYPOINT_STAGE_CONCURRENCY`: consumer overrides, e.g. `map=8,reviews=0`
//! - `WAYPOINT_ORCHESTRATION_CONCURRENCY`: orchestration consumers (default: 8)
//! - `WAYPOINT_RETRY_MAX_ATTEMPTS`: attempts per stage dispatch (default: 3)
//! - `WAYPOINT_RETRY_INITIAL_DELAY_MS`: first retry delay (default: 1000)
//! - `WAYPOINT_LOCK_TTL_SECS`: dependency lock TTL (default: 60)
//! - `WAYPOINT_LOCK_WAIT_SECS`: longest wait for a dependency lock (default: 60)
//! - `WAYPOINT_POLL_INTERVAL_MS`: queue poll interval (default: 500)
//! - `WAYPOINT_RUN_MIGRATIONS`: apply migrations on startup (default: false)
//! - `DB_MAX_CONNECTIONS`: PostgreSQL pool size (default: 10)

use anyhow::{anyhow, Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use waypoint_runtime::{ConcurrencyConfig, DispatcherConfig, RetryPolicy, WorkerPoolConfig};
use waypoint_storage::PoolConfig;

/// Worker process configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub redis_url: String,
    pub control_prefix: String,
    pub port: u16,
    pub admin_key: String,
    pub fetcher_url: String,
    pub fetcher_timeout: Duration,
    pub concurrency: ConcurrencyConfig,
    pub retry: RetryPolicy,
    pub lock_ttl: Duration,
    pub lock_wait: Duration,
    pub poll_interval: Duration,
    pub run_migrations: bool,
    pub db_max_connections: u32,
}

impl WorkerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| {
            lookup(name)
                .filter(|value| !value.trim().is_empty())
                .with_context(|| format!("{} environment variable not set", name))
        };

        let overrides = match lookup("WAYPOINT_STAGE_CONCURRENCY") {
            Some(raw) => ConcurrencyConfig::parse_overrides(&raw)
                .context("Invalid WAYPOINT_STAGE_CONCURRENCY value")?,
            None => Default::default(),
        };
        let concurrency = ConcurrencyConfig::default()
            .with_overrides(overrides)
            .with_orchestration(parse_or(&lookup, "WAYPOINT_ORCHESTRATION_CONCURRENCY", 8)?);

        let retry = RetryPolicy {
            max_attempts: parse_or(&lookup, "WAYPOINT_RETRY_MAX_ATTEMPTS", 3)?,
            initial_delay: Duration::from_millis(parse_or(
                &lookup,
                "WAYPOINT_RETRY_INITIAL_DELAY_MS",
                1000,
            )?),
            ..Default::default()
        };

        let config = Self {
            database_url: required("DATABASE_URL")?,
            redis_url: required("REDIS_URL")?,
            control_prefix: lookup("WAYPOINT_CONTROL_PREFIX")
                .unwrap_or_else(|| "waypoint".to_string()),
            port: parse_or(&lookup, "PORT", 8080)?,
            admin_key: required("WAYPOINT_ADMIN_KEY")?,
            fetcher_url: required("WAYPOINT_FETCHER_URL")?,
            fetcher_timeout: Duration::from_secs(parse_or(
                &lookup,
                "WAYPOINT_FETCHER_TIMEOUT_SECS",
                120,
            )?),
            concurrency,
            retry,
            lock_ttl: Duration::from_secs(parse_or(&lookup, "WAYPOINT_LOCK_TTL_SECS", 60)?),
            lock_wait: Duration::from_secs(parse_or(&lookup, "WAYPOINT_LOCK_WAIT_SECS", 60)?),
            poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "WAYPOINT_POLL_INTERVAL_MS",
                500,
            )?),
            run_migrations: parse_or(&lookup, "WAYPOINT_RUN_MIGRATIONS", false)?,
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", 10)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !self.redis_url.starts_with("redis://") && !self.redis_url.starts_with("rediss://") {
            return Err(anyhow!("REDIS_URL must be a redis:// or rediss:// URL"));
        }
        if !self.fetcher_url.starts_with("http://") && !self.fetcher_url.starts_with("https://") {
            return Err(anyhow!("WAYPOINT_FETCHER_URL must be an http(s) URL"));
        }
        if self.control_prefix.is_empty() || self.control_prefix.contains(char::is_whitespace) {
            return Err(anyhow!("WAYPOINT_CONTROL_PREFIX must be a non-empty word"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("WAYPOINT_RETRY_MAX_ATTEMPTS must be at least 1"));
        }
        if self.lock_ttl.is_zero() {
            return Err(anyhow!("WAYPOINT_LOCK_TTL_SECS must be greater than 0"));
        }
        if self.fetcher_timeout.is_zero() {
            return Err(anyhow!("WAYPOINT_FETCHER_TIMEOUT_SECS must be greater than 0"));
        }
        if self.concurrency.orchestration == 0 {
            return Err(anyhow!("WAYPOINT_ORCHESTRATION_CONCURRENCY must be at least 1"));
        }
        if self.db_max_connections == 0 {
            return Err(anyhow!("DB_MAX_CONNECTIONS must be greater than 0"));
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.db_max_connections,
            ..Default::default()
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            retry: self.retry.clone(),
            lock_ttl: self.lock_ttl,
            lock_wait: self.lock_wait,
            ..Default::default()
        }
    }

    pub fn pool_settings(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            concurrency: self.concurrency.clone(),
            poll_interval: self.poll_interval,
            ..Default::default()
        }
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {} value: '{}'", name, raw)),
        None => Ok(default),
    }
}
