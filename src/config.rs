//! Settings for connecting to the backend store.
//!
//! The settings are layered with figment: the defaults first, then any
//! `DATABASE_URL` and `DB_*` variables from the process environment.

use std::{fmt::Display, str::FromStr, time::Duration};

use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Serialize};

/// The connection URI of the backend store. Required.
pub const DATABASE_URL: &str = "DATABASE_URL";
/// Upper bound on a single connect attempt, in milliseconds.
pub const CONNECT_TIMEOUT_MS: &str = "DB_CONNECT_TIMEOUT_MS";
/// How long an operation may block on a busy store, in milliseconds.
pub const SOCKET_TIMEOUT_MS: &str = "DB_SOCKET_TIMEOUT_MS";
/// Number of pooled connections kept open while idle.
pub const MIN_POOL_SIZE: &str = "DB_MIN_POOL_SIZE";
/// Maximum number of pooled connections.
pub const MAX_POOL_SIZE: &str = "DB_MAX_POOL_SIZE";
/// How long a pooled connection may sit idle before it is closed, in milliseconds.
pub const MAX_IDLE_TIME_MS: &str = "DB_MAX_IDLE_TIME_MS";
/// Whether a write that hit a busy store is retried once.
pub const RETRY_WRITES: &str = "DB_RETRY_WRITES";
/// Whether a read that hit a busy store is retried once.
pub const RETRY_READS: &str = "DB_RETRY_READS";
/// The durability level for writes, see [WriteConcern].
pub const WRITE_CONCERN: &str = "DB_WRITE_CONCERN";
/// How long a write waits for a pooled connection, in milliseconds.
pub const WRITE_CONCERN_TIMEOUT_MS: &str = "DB_WRITE_CONCERN_TIMEOUT_MS";
/// Number of connect attempts before giving up.
pub const MAX_RETRIES: &str = "DB_MAX_RETRIES";
/// Fixed delay between failed connect attempts, in milliseconds.
pub const RETRY_BACKOFF_MS: &str = "DB_RETRY_BACKOFF_MS";

/// Errors that occur while reading the connection settings.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    /// A setting was present but could not be parsed.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// The name of the setting.
        key: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The layered settings could not be read.
    #[error("could not load the connection settings: {0}")]
    Load(String),

    /// The pool bounds do not describe a usable pool.
    #[error("invalid pool size bounds: min {min}, max {max}")]
    InvalidPoolBounds {
        /// The configured minimum pool size.
        min: u32,
        /// The configured maximum pool size.
        max: u32,
    },

    /// At least one connect attempt is required.
    #[error("DB_MAX_RETRIES must be at least 1")]
    ZeroRetries,

    /// A timeout that must be positive was set to zero.
    #[error("{key} must be greater than zero")]
    ZeroDuration {
        /// The name of the setting.
        key: &'static str,
    },
}

/// How durable a write must be before it is acknowledged.
///
/// Read from a case-insensitive name or from the levels `0` and `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "RawWriteConcern")]
pub enum WriteConcern {
    /// Writes are handed to the OS without waiting for them to reach disk.
    Unacknowledged,
    /// Writes are synced at the critical moments only.
    Acknowledged,
    /// Writes are fully synced before they are acknowledged.
    Majority,
}

impl WriteConcern {
    /// The value of SQLite's `PRAGMA synchronous` that gives this durability.
    pub fn synchronous_pragma(self) -> &'static str {
        match self {
            WriteConcern::Unacknowledged => "OFF",
            WriteConcern::Acknowledged => "NORMAL",
            WriteConcern::Majority => "FULL",
        }
    }
}

impl FromStr for WriteConcern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" | "unacknowledged" => Ok(WriteConcern::Unacknowledged),
            "1" | "acknowledged" => Ok(WriteConcern::Acknowledged),
            "majority" => Ok(WriteConcern::Majority),
            other => Err(format!(
                "expected one of \"unacknowledged\", \"acknowledged\" or \"majority\", got \"{other}\""
            )),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawWriteConcern {
    Level(u64),
    Name(String),
}

impl TryFrom<RawWriteConcern> for WriteConcern {
    type Error = String;

    fn try_from(raw: RawWriteConcern) -> Result<Self, Self::Error> {
        match raw {
            RawWriteConcern::Level(level) => level.to_string().parse(),
            RawWriteConcern::Name(name) => name.parse(),
        }
    }
}

impl Display for WriteConcern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WriteConcern::Unacknowledged => "unacknowledged",
            WriteConcern::Acknowledged => "acknowledged",
            WriteConcern::Majority => "majority",
        };

        write!(f, "{name}")
    }
}

/// The settings used by [ConnectionCache](crate::ConnectionCache) and its
/// [Connector](crate::Connector).
///
/// Durations are written in whole milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Where the backend store lives. `None` is a fatal misconfiguration that
    /// is reported on the first call to `acquire`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Upper bound on a single connect attempt.
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// How long an operation may block on a busy store.
    #[serde(with = "millis")]
    pub socket_timeout: Duration,
    /// Number of pooled connections kept open while idle.
    pub min_pool_size: u32,
    /// Maximum number of pooled connections.
    pub max_pool_size: u32,
    /// How long a pooled connection may sit idle before it is closed.
    #[serde(with = "millis")]
    pub max_idle_time: Duration,
    /// Retry a write once if the store was busy.
    pub retry_writes: bool,
    /// Retry a read once if the store was busy.
    pub retry_reads: bool,
    /// Durability level for writes.
    pub write_concern: WriteConcern,
    /// How long a write waits for a pooled connection.
    #[serde(with = "millis")]
    pub write_concern_timeout: Duration,
    /// Number of physical connect attempts before `acquire` gives up.
    pub max_retries: u32,
    /// Fixed delay between failed connect attempts.
    #[serde(with = "millis")]
    pub retry_backoff: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            uri: None,
            connect_timeout: Duration::from_secs(10),
            socket_timeout: Duration::from_secs(45),
            min_pool_size: 1,
            max_pool_size: 10,
            max_idle_time: Duration::from_secs(30),
            retry_writes: true,
            retry_reads: true,
            write_concern: WriteConcern::Majority,
            write_concern_timeout: Duration::from_millis(2500),
            max_retries: 3,
            retry_backoff: Duration::from_secs(5),
        }
    }
}

impl ConnectionConfig {
    /// Read the settings from the process environment.
    ///
    /// # Errors
    /// Returns an error if a variable is set to a value that cannot be parsed
    /// or the resulting settings are inconsistent.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_figment(&Self::figment())
    }

    /// The defaults overridden by the recognised environment variables.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default())).merge(env_provider())
    }

    /// Extract and validate the settings from `figment`. A blank URI counts as
    /// missing.
    ///
    /// # Errors
    /// Returns an error if a value cannot be parsed or the resulting settings
    /// are inconsistent.
    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        let mut config: Self = figment.extract().map_err(ConfigError::from)?;

        config.uri = config
            .uri
            .map(|uri| uri.trim().to_owned())
            .filter(|uri| !uri.is_empty());
        config.validate()?;

        Ok(config)
    }

    /// Set the connection URI.
    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Check that the settings describe a usable connection.
    ///
    /// # Errors
    /// Returns [ConfigError::InvalidPoolBounds] if the pool cannot hold a
    /// connection or its minimum exceeds its maximum,
    /// [ConfigError::ZeroRetries] if no connect attempt would ever be made and
    /// [ConfigError::ZeroDuration] if the connect timeout or max idle time is
    /// zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pool_size == 0 || self.min_pool_size > self.max_pool_size {
            return Err(ConfigError::InvalidPoolBounds {
                min: self.min_pool_size,
                max: self.max_pool_size,
            });
        }

        if self.max_retries == 0 {
            return Err(ConfigError::ZeroRetries);
        }

        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration {
                key: CONNECT_TIMEOUT_MS,
            });
        }

        if self.max_idle_time.is_zero() {
            return Err(ConfigError::ZeroDuration {
                key: MAX_IDLE_TIME_MS,
            });
        }

        Ok(())
    }
}

impl From<figment::Error> for ConfigError {
    fn from(error: figment::Error) -> Self {
        let key = error
            .path
            .first()
            .and_then(|field| ENV_FIELDS.iter().find(|(_, name)| *name == field.as_str()))
            .map(|(key, _)| *key);

        match key {
            Some(key) => ConfigError::InvalidValue {
                key,
                reason: error.kind.to_string(),
            },
            None => ConfigError::Load(error.to_string()),
        }
    }
}

/// Environment variables and the settings they override.
const ENV_FIELDS: [(&str, &str); 12] = [
    (DATABASE_URL, "uri"),
    (CONNECT_TIMEOUT_MS, "connect_timeout"),
    (SOCKET_TIMEOUT_MS, "socket_timeout"),
    (MIN_POOL_SIZE, "min_pool_size"),
    (MAX_POOL_SIZE, "max_pool_size"),
    (MAX_IDLE_TIME_MS, "max_idle_time"),
    (RETRY_WRITES, "retry_writes"),
    (RETRY_READS, "retry_reads"),
    (WRITE_CONCERN, "write_concern"),
    (WRITE_CONCERN_TIMEOUT_MS, "write_concern_timeout"),
    (MAX_RETRIES, "max_retries"),
    (RETRY_BACKOFF_MS, "retry_backoff"),
];

/// Only the variables in [ENV_FIELDS] are read, each renamed to its setting.
fn env_provider() -> Env {
    Env::raw()
        .only(&ENV_FIELDS.map(|(key, _)| key))
        .map(|key| {
            ENV_FIELDS
                .iter()
                .find(|(name, _)| key.as_str().eq_ignore_ascii_case(name))
                .map_or_else(|| key.into(), |(_, field)| (*field).into())
        })
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
