//! Environment-driven configuration for the tally ingest worker.
//!
//! Every recognised key is read straight from the process environment via a
//! Figment pipeline; unset keys fall back to serde defaults. Values with an
//! operational floor (poll interval, scheduler intervals, window lengths) are
//! clamped after extraction, with a warning when a value had to be raised.

use std::{net::Ipv4Addr, time::Duration};

use figment::{Figment, providers::Env};
use serde::Deserialize;

mod flag;
mod redacted;

pub use self::redacted::Redacted;

/// Dispatcher sleep between empty queue polls (`POLL_INTERVAL_MS`).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
/// Floor for `POLL_INTERVAL_MS`.
pub const MIN_POLL_INTERVAL_MS: u64 = 1_000;

/// Default commerce API version (`COMMERCE_API_VERSION`).
pub const DEFAULT_COMMERCE_API_VERSION: &str = "2025-01";

/// Default trailing window, in days, for both the commerce window fill and
/// the ads attribution window.
pub const DEFAULT_WINDOW_DAYS: u32 = 7;

/// Default scheduler enqueue interval (`*_FRESH_SCHED_MINUTES`).
pub const DEFAULT_FRESH_SCHED_MINUTES: u64 = 60;
/// Floor for `*_FRESH_SCHED_MINUTES`.
pub const MIN_FRESH_SCHED_MINUTES: u64 = 5;

/// Default health endpoint port (`HEALTH_PORT`).
pub const DEFAULT_HEALTH_PORT: u16 = 3_000;

/// Default database connection pool size (`DB_POOL_SIZE`).
pub const DEFAULT_DB_POOL_SIZE: u32 = 5;

/// The environment keys the worker recognises. Anything else in the
/// environment is ignored.
const ENV_KEYS: &[&str] = &[
    "database_url",
    "poll_interval_ms",
    "commerce_api_version",
    "commerce_window_days",
    "ads_attribution_window_days",
    "commerce_fresh_sched_minutes",
    "ads_fresh_sched_minutes",
    "cron_secret",
    "ads_jobs_enabled",
    "ads_api_base_url",
    "health_port",
    "ipv4_override",
    "db_pool_size",
];

/// Resolved worker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Postgres connection string (`DATABASE_URL`, required).
    pub database_url: String,

    /// Dispatcher sleep between empty queue polls, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Commerce GraphQL API version.
    #[serde(default = "default_commerce_api_version")]
    pub commerce_api_version: String,

    /// Trailing window re-fetched by commerce window-fill runs, in days.
    #[serde(default = "default_window_days")]
    pub commerce_window_days: u32,

    /// Ads attribution window, in days. Every day in the window is
    /// re-fetched on each ads run, so this is also the per-run API budget.
    #[serde(default = "default_window_days")]
    pub ads_attribution_window_days: u32,

    /// Minimum minutes between auto-enqueued commerce fresh runs.
    #[serde(default = "default_fresh_sched_minutes")]
    pub commerce_fresh_sched_minutes: u64,

    /// Minimum minutes between auto-enqueued ads fresh runs.
    #[serde(default = "default_fresh_sched_minutes")]
    pub ads_fresh_sched_minutes: u64,

    /// Shared secret for the scheduler endpoints. When unset the endpoints
    /// accept any request (trusted-network deployments).
    #[serde(default)]
    pub cron_secret: Option<Redacted<String>>,

    /// Feature flag for the ads job family (`ADS_JOBS_ENABLED`).
    #[serde(default, deserialize_with = "flag::deserialize")]
    pub ads_jobs_enabled: bool,

    /// Override for the ads API base URL (tests, proxies).
    #[serde(default)]
    pub ads_api_base_url: Option<String>,

    /// Port the health + scheduler HTTP listener binds to.
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Optional IPv4 host override for DNS environments that cannot resolve
    /// IPv6 (`IPV4_OVERRIDE`).
    #[serde(default)]
    pub ipv4_override: Option<Ipv4Addr>,

    /// Database connection pool size.
    #[serde(default = "default_db_pool_size")]
    pub db_pool_size: u32,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Config, ConfigError> {
        Self::extract(Figment::new().merge(Env::raw().only(ENV_KEYS)))
    }

    fn extract(figment: Figment) -> Result<Config, ConfigError> {
        if figment.find_value("database_url").is_err() {
            return Err(ConfigError::MissingDatabaseUrl);
        }
        let config: Config = figment.extract()?;
        Ok(config.clamped())
    }

    /// Apply operational floors, warning when a value had to be raised.
    fn clamped(mut self) -> Config {
        self.poll_interval_ms = floor(
            "POLL_INTERVAL_MS",
            self.poll_interval_ms,
            MIN_POLL_INTERVAL_MS,
        );
        self.commerce_window_days = floor("COMMERCE_WINDOW_DAYS", self.commerce_window_days, 1);
        self.ads_attribution_window_days = floor(
            "ADS_ATTRIBUTION_WINDOW_DAYS",
            self.ads_attribution_window_days,
            1,
        );
        self.commerce_fresh_sched_minutes = floor(
            "COMMERCE_FRESH_SCHED_MINUTES",
            self.commerce_fresh_sched_minutes,
            MIN_FRESH_SCHED_MINUTES,
        );
        self.ads_fresh_sched_minutes = floor(
            "ADS_FRESH_SCHED_MINUTES",
            self.ads_fresh_sched_minutes,
            MIN_FRESH_SCHED_MINUTES,
        );
        self.db_pool_size = floor("DB_POOL_SIZE", self.db_pool_size, 1);
        self
    }

    /// Dispatcher poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn floor<T: Ord + Copy + std::fmt::Display>(key: &str, value: T, min: T) -> T {
    if value < min {
        tracing::warn!(%key, %value, %min, "configured value below floor, raising to floor");
        min
    } else {
        value
    }
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_commerce_api_version() -> String {
    DEFAULT_COMMERCE_API_VERSION.to_string()
}

fn default_window_days() -> u32 {
    DEFAULT_WINDOW_DAYS
}

fn default_fresh_sched_minutes() -> u64 {
    DEFAULT_FRESH_SCHED_MINUTES
}

fn default_health_port() -> u16 {
    DEFAULT_HEALTH_PORT
}

fn default_db_pool_size() -> u32 {
    DEFAULT_DB_POOL_SIZE
}

/// Errors from [`Config::load`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `DATABASE_URL` is not set. The worker cannot start without it.
    #[error("missing required environment variable DATABASE_URL")]
    MissingDatabaseUrl,

    /// A key was set to a value that does not parse as its expected type.
    #[error("invalid configuration: {0}")]
    Extract(#[from] figment::Error),
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    const TEST_DB_URL: &str = "postgresql://localhost:5432/tally_test";

    #[test]
    fn defaults_apply_when_only_database_url_is_set() {
        Jail::expect_with(|jail| {
            jail.set_env("DATABASE_URL", TEST_DB_URL);

            let config = Config::load().expect("load failed");

            assert_eq!(config.database_url, TEST_DB_URL);
            assert_eq!(config.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
            assert_eq!(config.commerce_api_version, DEFAULT_COMMERCE_API_VERSION);
            assert_eq!(config.ads_attribution_window_days, DEFAULT_WINDOW_DAYS);
            assert_eq!(config.health_port, DEFAULT_HEALTH_PORT);
            assert_eq!(config.db_pool_size, DEFAULT_DB_POOL_SIZE);
            assert!(!config.ads_jobs_enabled);
            assert!(config.cron_secret.is_none());
            Ok(())
        });
    }

    #[test]
    fn missing_database_url_is_a_typed_error() {
        Jail::expect_with(|_jail| {
            let err = Config::load().expect_err("load should fail");
            assert!(matches!(err, ConfigError::MissingDatabaseUrl));
            Ok(())
        });
    }

    #[test]
    fn floors_are_applied() {
        Jail::expect_with(|jail| {
            jail.set_env("DATABASE_URL", TEST_DB_URL);
            jail.set_env("POLL_INTERVAL_MS", "100");
            jail.set_env("COMMERCE_FRESH_SCHED_MINUTES", "1");
            jail.set_env("ADS_ATTRIBUTION_WINDOW_DAYS", "0");

            let config = Config::load().expect("load failed");

            assert_eq!(config.poll_interval_ms, MIN_POLL_INTERVAL_MS);
            assert_eq!(config.commerce_fresh_sched_minutes, MIN_FRESH_SCHED_MINUTES);
            assert_eq!(config.ads_attribution_window_days, 1);
            Ok(())
        });
    }

    #[test]
    fn ads_flag_accepts_common_truthy_spellings() {
        for (raw, expected) in [
            ("true", true),
            ("TRUE", true),
            ("1", true),
            ("yes", true),
            ("false", false),
            ("0", false),
            ("no", false),
        ] {
            Jail::expect_with(|jail| {
                jail.set_env("DATABASE_URL", TEST_DB_URL);
                jail.set_env("ADS_JOBS_ENABLED", raw);

                let config = Config::load().expect("load failed");
                assert_eq!(config.ads_jobs_enabled, expected, "raw value: {raw}");
                Ok(())
            });
        }
    }

    #[test]
    fn cron_secret_is_redacted_in_debug_output() {
        Jail::expect_with(|jail| {
            jail.set_env("DATABASE_URL", TEST_DB_URL);
            jail.set_env("CRON_SECRET", "s3cr3t");

            let config = Config::load().expect("load failed");

            let debug = format!("{config:?}");
            assert!(!debug.contains("s3cr3t"), "secret leaked: {debug}");
            assert_eq!(
                config.cron_secret.as_deref().map(String::as_str),
                Some("s3cr3t")
            );
            Ok(())
        });
    }

    #[test]
    fn ipv4_override_parses() {
        Jail::expect_with(|jail| {
            jail.set_env("DATABASE_URL", TEST_DB_URL);
            jail.set_env("IPV4_OVERRIDE", "203.0.113.7");

            let config = Config::load().expect("load failed");
            assert_eq!(config.ipv4_override, Some(Ipv4Addr::new(203, 0, 113, 7)));
            Ok(())
        });
    }
}
