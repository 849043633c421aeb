//! Worker configuration loaded from environment variables.
//!
//! Fail-fast: required variables must be present and every set variable must
//! parse, or the worker exits with a clear error before touching the database.

use std::env::VarError;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Development fallback for `WEBHOOK_MASTER_KEY`. Refused in production.
pub const INSECURE_MASTER_KEY: &str = "development-webhook-master-key-change-in-production";

const SECS_PER_DAY: u64 = 24 * 60 * 60;

// ── AppEnvironment ────────────────────────────────────────────────────────

/// Application environment mode.
///
/// Production refuses insecure defaults; development allows them with a
/// warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppEnvironment {
    #[default]
    Development,
    Production,
}

impl AppEnvironment {
    #[must_use]
    pub fn is_production(&self) -> bool {
        *self == Self::Production
    }
}

impl FromStr for AppEnvironment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            other => Err(format!("unknown environment '{other}'")),
        }
    }
}

impl fmt::Display for AppEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Production => write!(f, "production"),
        }
    }
}

// ── ConfigError ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },
}

// ── Config ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Config {
    pub app_env: AppEnvironment,

    pub database_url: String,

    /// Master key the subscriber secret encryption key is derived from.
    pub master_key: String,

    /// Log filter directive used when `RUST_LOG` does not parse.
    pub rust_log: String,

    pub db_max_connections: u32,

    /// Per-request timeout for outbound webhook POSTs.
    pub delivery_timeout: Duration,

    pub poll_interval: Duration,
    pub error_cooldown: Duration,
    pub batch_size: i64,
    pub max_attempts: i32,

    /// How long successful delivery rows are kept.
    pub success_retention: Duration,

    pub circuit_failure_threshold: u32,
    pub circuit_open_timeout: Duration,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("app_env", &self.app_env)
            .field("database_url", &"[REDACTED]")
            .field("master_key", &"[REDACTED]")
            .field("rust_log", &self.rust_log)
            .field("db_max_connections", &self.db_max_connections)
            .field("delivery_timeout", &self.delivery_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("error_cooldown", &self.error_cooldown)
            .field("batch_size", &self.batch_size)
            .field("max_attempts", &self.max_attempts)
            .field("success_retention", &self.success_retention)
            .field("circuit_failure_threshold", &self.circuit_failure_threshold)
            .field("circuit_open_timeout", &self.circuit_open_timeout)
            .finish()
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| std::env::var(key))
    }

    /// Load configuration from a custom variable reader.
    ///
    /// Lets tests supply variables without mutating process-global state.
    pub fn from_reader<F>(reader: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let app_env = match optional(&reader, "APP_ENV") {
            Some(value) => {
                value
                    .parse::<AppEnvironment>()
                    .map_err(|message| ConfigError::InvalidValue {
                        var: "APP_ENV".to_string(),
                        message,
                    })?
            }
            None => AppEnvironment::default(),
        };

        let database_url = optional(&reader, "DATABASE_URL")
            .ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let master_key = match optional(&reader, "WEBHOOK_MASTER_KEY") {
            Some(key) if app_env.is_production() && key == INSECURE_MASTER_KEY => {
                return Err(ConfigError::InvalidValue {
                    var: "WEBHOOK_MASTER_KEY".to_string(),
                    message: "the development default is not allowed in production".to_string(),
                });
            }
            Some(key) => key,
            None if app_env.is_production() => {
                return Err(ConfigError::MissingVar("WEBHOOK_MASTER_KEY".to_string()));
            }
            None => INSECURE_MASTER_KEY.to_string(),
        };

        let rust_log = optional(&reader, "RUST_LOG").unwrap_or_else(|| "info".to_string());

        let db_max_connections = parse_or(&reader, "DB_MAX_CONNECTIONS", 10u32)?;
        let delivery_timeout = secs_or(&reader, "DELIVERY_TIMEOUT_SECS", 5)?;
        let poll_interval = secs_or(&reader, "RETRY_POLL_INTERVAL_SECS", 60)?;
        let error_cooldown = secs_or(&reader, "RETRY_ERROR_COOLDOWN_SECS", 30)?;
        let batch_size = parse_or(&reader, "RETRY_BATCH_SIZE", 100i64)?;
        let max_attempts = parse_or(&reader, "RETRY_MAX_ATTEMPTS", 5i32)?;
        let retention_days = parse_or(&reader, "SUCCESS_RETENTION_DAYS", 30u64)?;
        let circuit_failure_threshold = parse_or(&reader, "CIRCUIT_FAILURE_THRESHOLD", 5u32)?;
        let circuit_open_timeout = secs_or(&reader, "CIRCUIT_OPEN_TIMEOUT_SECS", 60)?;

        if delivery_timeout.is_zero() {
            return Err(invalid("DELIVERY_TIMEOUT_SECS", "must be greater than 0"));
        }
        if batch_size < 1 {
            return Err(invalid("RETRY_BATCH_SIZE", "must be at least 1"));
        }
        if max_attempts < 1 {
            return Err(invalid("RETRY_MAX_ATTEMPTS", "must be at least 1"));
        }
        if circuit_failure_threshold < 1 {
            return Err(invalid("CIRCUIT_FAILURE_THRESHOLD", "must be at least 1"));
        }

        Ok(Self {
            app_env,
            database_url,
            master_key,
            rust_log,
            db_max_connections,
            delivery_timeout,
            poll_interval,
            error_cooldown,
            batch_size,
            max_attempts,
            success_retention: Duration::from_secs(retention_days.saturating_mul(SECS_PER_DAY)),
            circuit_failure_threshold,
            circuit_open_timeout,
        })
    }

    /// Whether the development master key is in use.
    #[must_use]
    pub fn uses_insecure_master_key(&self) -> bool {
        self.master_key == INSECURE_MASTER_KEY
    }
}

/// A set, non-empty variable.
fn optional<F>(reader: &F, var: &str) -> Option<String>
where
    F: Fn(&str) -> Result<String, VarError>,
{
    reader(var).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<F, T>(reader: &F, var: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Result<String, VarError>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match optional(reader, var) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(var, &e.to_string())),
        None => Ok(default),
    }
}

fn secs_or<F>(reader: &F, var: &str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Result<String, VarError>,
{
    parse_or(reader, var, default).map(Duration::from_secs)
}

fn invalid(var: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        var: var.to_string(),
        message: message.to_string(),
    }
}
