//! Runtime settings read from the environment.
//!
//! # Environment Variables
//!
//! - `LIVETALLY_ENV`: development | testing | staging | production (default: development)
//! - `LOG_LEVEL`: trace, debug, info, warning, error, critical (default: info)
//! - `LOG_FORMAT`: pretty | json (default: pretty, always json in production)
//! - `DATABASE_URL`: SQLite URL; unset keeps ballots in memory
//! - `LOCK_BACKEND`, `BUS_BACKEND`: local | distributed (default: local)
//! - `LOCK_FALLBACK`: strict | permissive (default: strict)
//! - `LOCK_LEASE_MS`, `LOCK_ACQUIRE_TIMEOUT_MS`, `LOCK_RETRY_MS`
//! - `SUBSCRIBER_QUEUE_CAPACITY`: buffered updates per live viewer (default: 32)
//! - `KEEPALIVE_SECS`: idle interval between keep-alives (default: 15)
//! - `REAPER_INTERVAL_SECS`: sweep period, 0 disables (default: 60)
//! - `BUS_RECONNECT_INITIAL_MS`, `BUS_RECONNECT_MAX_MS`: listener backoff bounds
//!
//! Several workers sharing one database must use `LOCK_BACKEND=distributed`.
//! A local lock serializes votes only within its own process, and each
//! worker's in-memory tallies would drift apart; [`Settings::check_workers`]
//! rejects that combination.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use log::LevelFilter;
use thiserror::Error;

use crate::bus::{ReconnectConfig, DEFAULT_QUEUE_CAPACITY};
use crate::lock::LeaseConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{key} is required in {environment}")]
    Required {
        key: &'static str,
        environment: Environment,
    },

    #[error("{environment} requires {requirement}")]
    Profile {
        environment: Environment,
        requirement: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Testing,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Testing => "testing",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }

    /// Staging mirrors production's infrastructure requirements.
    pub fn is_deployed(&self) -> bool {
        matches!(self, Environment::Staging | Environment::Production)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "testing" | "test" => Ok(Environment::Testing),
            "staging" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            _ => Err("expected development, testing, staging or production".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err("expected pretty or json".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Local,
    Distributed,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "memory" => Ok(Backend::Local),
            "distributed" | "redis" => Ok(Backend::Distributed),
            _ => Err("expected local or distributed".to_string()),
        }
    }
}

/// What the distributed lock does when the coordinator cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackMode {
    /// Fail the vote with a retryable error
    Strict,
    /// Continue with a process-local lock (single-process deployments only)
    Permissive,
}

impl FromStr for FallbackMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(FallbackMode::Strict),
            "permissive" => Ok(FallbackMode::Permissive),
            _ => Err("expected strict or permissive".to_string()),
        }
    }
}

fn parse_level(s: &str) -> Result<LevelFilter, String> {
    match s.to_lowercase().as_str() {
        "warning" => Ok(LevelFilter::Warn),
        "critical" => Ok(LevelFilter::Error),
        other => LevelFilter::from_str(other)
            .map_err(|_| "expected trace, debug, info, warning, error or critical".to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub environment: Environment,
    pub log_level: LevelFilter,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub lock_backend: Backend,
    pub bus_backend: Backend,
    pub lock_fallback: FallbackMode,
    pub lease: LeaseConfig,
    pub subscriber_queue_capacity: usize,
    pub keepalive: Duration,
    /// `None` when the background reaper is disabled
    pub reaper_interval: Option<Duration>,
    pub reconnect: ReconnectConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            log_level: LevelFilter::Info,
            log_format: LogFormat::Pretty,
            database_url: None,
            lock_backend: Backend::Local,
            bus_backend: Backend::Local,
            lock_fallback: FallbackMode::Strict,
            lease: LeaseConfig::default(),
            subscriber_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            keepalive: Duration::from_secs(15),
            reaper_interval: Some(Duration::from_secs(60)),
            reconnect: ReconnectConfig::default(),
        }
    }
}

struct Source<F> {
    lookup: F,
}

impl<F> Source<F>
where
    F: Fn(&str) -> Option<String>,
{
    // Empty values count as unset
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.raw(key) {
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
            None => Ok(default),
        }
    }

    fn positive(&self, key: &'static str, default: u64) -> Result<u64, ConfigError> {
        let value = self.parse(key, default)?;
        if value == 0 {
            return Err(ConfigError::Invalid {
                key,
                value: value.to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(value)
    }

    fn millis(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.positive(key, default.as_millis() as u64).map(Duration::from_millis)
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from any key lookup, applying the profile rules.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let source = Source { lookup };
        let defaults = Settings::default();

        let environment = source.parse("LIVETALLY_ENV", defaults.environment)?;
        let log_level = match source.raw("LOG_LEVEL") {
            Some(value) => parse_level(&value).map_err(|reason| ConfigError::Invalid {
                key: "LOG_LEVEL",
                value,
                reason,
            })?,
            None => defaults.log_level,
        };
        let mut log_format = source.parse("LOG_FORMAT", defaults.log_format)?;
        if environment == Environment::Production {
            log_format = LogFormat::Json;
        }

        let lease = LeaseConfig {
            lease: source.millis("LOCK_LEASE_MS", defaults.lease.lease)?,
            acquire_timeout: source.millis("LOCK_ACQUIRE_TIMEOUT_MS", defaults.lease.acquire_timeout)?,
            retry_interval: source.millis("LOCK_RETRY_MS", defaults.lease.retry_interval)?,
        };

        let reconnect = ReconnectConfig {
            initial_delay: source.millis("BUS_RECONNECT_INITIAL_MS", defaults.reconnect.initial_delay)?,
            max_delay: source.millis("BUS_RECONNECT_MAX_MS", defaults.reconnect.max_delay)?,
            ..defaults.reconnect
        };
        if reconnect.max_delay < reconnect.initial_delay {
            return Err(ConfigError::Invalid {
                key: "BUS_RECONNECT_MAX_MS",
                value: reconnect.max_delay.as_millis().to_string(),
                reason: "must not be below BUS_RECONNECT_INITIAL_MS".to_string(),
            });
        }

        let reaper_secs: u64 = source.parse("REAPER_INTERVAL_SECS", 60)?;
        let reaper_interval = if environment == Environment::Testing || reaper_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(reaper_secs))
        };

        let settings = Settings {
            environment,
            log_level,
            log_format,
            database_url: source.raw("DATABASE_URL"),
            lock_backend: source.parse("LOCK_BACKEND", defaults.lock_backend)?,
            bus_backend: source.parse("BUS_BACKEND", defaults.bus_backend)?,
            lock_fallback: source.parse("LOCK_FALLBACK", defaults.lock_fallback)?,
            lease,
            subscriber_queue_capacity: source
                .positive("SUBSCRIBER_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY as u64)?
                as usize,
            keepalive: Duration::from_secs(source.positive("KEEPALIVE_SECS", 15)?),
            reaper_interval,
            reconnect,
        };
        settings.check_profile()?;
        Ok(settings)
    }

    fn check_profile(&self) -> Result<(), ConfigError> {
        if !self.environment.is_deployed() {
            return Ok(());
        }
        if self.database_url.is_none() {
            return Err(ConfigError::Required {
                key: "DATABASE_URL",
                environment: self.environment,
            });
        }
        if self.lock_backend != Backend::Distributed || self.bus_backend != Backend::Distributed {
            return Err(ConfigError::Profile {
                environment: self.environment,
                requirement: "distributed lock and bus backends",
            });
        }
        if self.lock_fallback != FallbackMode::Strict {
            return Err(ConfigError::Profile {
                environment: self.environment,
                requirement: "strict lock fallback",
            });
        }
        Ok(())
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_url.is_none()
    }

    pub fn needs_coordinator(&self) -> bool {
        self.lock_backend == Backend::Distributed || self.bus_backend == Backend::Distributed
    }

    /// Refuses a local lock when more than one worker records votes.
    pub fn check_workers(&self, workers: usize) -> Result<(), ConfigError> {
        if workers > 1 && self.lock_backend == Backend::Local {
            return Err(ConfigError::Invalid {
                key: "LOCK_BACKEND",
                value: "local".to_string(),
                reason: format!("{} workers share one database and need the distributed lock", workers),
            });
        }
        Ok(())
    }
}
