//! Delta Stream Configuration Settings
//!
//! Configuration types for the stream server and the sync client, loaded
//! from environment variables.
//!
//! Both loaders take a variable lookup function so tests can supply values
//! without mutating the process environment.

use std::time::Duration;

use chrono::TimeDelta;

// =============================================================================
// Server
// =============================================================================

/// Database connection settings.
#[derive(Clone)]
pub struct DatabaseSettings {
    /// Postgres connection URL.
    pub url: String,
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// Minimum idle connections.
    pub min_connections: u32,
    /// Time to wait for a pooled connection.
    pub acquire_timeout: Duration,
    /// Time budget for a single source query.
    pub query_timeout: Duration,
}

impl DatabaseSettings {
    /// Settings with default pool sizing for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(10),
        }
    }
}

impl std::fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("url", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// WebSocket server port.
    pub ws_port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            ws_port: 5001,
            health_port: 8082,
        }
    }
}

/// Poll cadence and outbound buffering.
#[derive(Debug, Clone)]
pub struct PollSettings {
    /// Period between ticks.
    pub interval: Duration,
    /// Outbound messages buffered per connection before it counts as a
    /// slow consumer.
    pub outbound_capacity: usize,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            outbound_capacity: 64,
        }
    }
}

/// Complete stream server configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Database settings.
    pub database: DatabaseSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Poll settings.
    pub poll: PollSettings,
}

impl StreamConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `DATABASE_URL` is missing or a value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Create configuration from a variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if `DATABASE_URL` is missing or a value is invalid.
    pub fn from_vars<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = var("DATABASE_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;
        if url.trim().is_empty() {
            return Err(ConfigError::EmptyValue("DATABASE_URL".to_string()));
        }

        let db_defaults = DatabaseSettings::new(String::new());
        let database = DatabaseSettings {
            url,
            max_connections: parse_var(
                &var,
                "DELTA_STREAM_DB_MAX_CONNECTIONS",
                db_defaults.max_connections,
            ),
            min_connections: parse_var(
                &var,
                "DELTA_STREAM_DB_MIN_CONNECTIONS",
                db_defaults.min_connections,
            ),
            acquire_timeout: parse_var_secs(
                &var,
                "DELTA_STREAM_DB_ACQUIRE_TIMEOUT_SECS",
                db_defaults.acquire_timeout,
            ),
            query_timeout: parse_var_secs(
                &var,
                "DELTA_STREAM_QUERY_TIMEOUT_SECS",
                db_defaults.query_timeout,
            ),
        };
        if database.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DELTA_STREAM_DB_MAX_CONNECTIONS".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if database.min_connections > database.max_connections {
            return Err(ConfigError::InvalidValue {
                key: "DELTA_STREAM_DB_MIN_CONNECTIONS".to_string(),
                reason: "must not exceed DELTA_STREAM_DB_MAX_CONNECTIONS".to_string(),
            });
        }

        let server = ServerSettings {
            ws_port: parse_var(&var, "DELTA_STREAM_WS_PORT", ServerSettings::default().ws_port),
            health_port: parse_var(
                &var,
                "DELTA_STREAM_HEALTH_PORT",
                ServerSettings::default().health_port,
            ),
        };

        let poll = PollSettings {
            interval: parse_var_secs(
                &var,
                "DELTA_STREAM_POLL_INTERVAL_SECS",
                PollSettings::default().interval,
            ),
            outbound_capacity: parse_var(
                &var,
                "DELTA_STREAM_OUTBOUND_CAPACITY",
                PollSettings::default().outbound_capacity,
            ),
        };
        if poll.interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "DELTA_STREAM_POLL_INTERVAL_SECS".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if poll.outbound_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DELTA_STREAM_OUTBOUND_CAPACITY".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            database,
            server,
            poll,
        })
    }
}

// =============================================================================
// Client
// =============================================================================

/// Reconnection backoff settings.
#[derive(Debug, Clone)]
pub struct ReconnectSettings {
    /// Initial reconnection delay.
    pub delay_initial: Duration,
    /// Maximum reconnection delay.
    pub delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            delay_initial: Duration::from_millis(500),
            delay_max: Duration::from_secs(30),
            delay_multiplier: 2.0,
            max_attempts: 0, // Unlimited
        }
    }
}

/// Sync client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server WebSocket URL.
    pub url: String,
    /// Instrument to subscribe to.
    pub instrument: String,
    /// Optional history bound for the sync store.
    pub retention: Option<TimeDelta>,
    /// Reconnect if no frame arrives within this window.
    pub liveness_timeout: Duration,
    /// Reconnection backoff.
    pub reconnect: ReconnectSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:5001/".to_string(),
            instrument: "btc".to_string(),
            retention: None,
            liveness_timeout: Duration::from_secs(20),
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl ClientConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Create configuration from a variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is not a WebSocket URL or the instrument
    /// is empty.
    pub fn from_vars<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let url = var("DELTA_STREAM_URL").unwrap_or(defaults.url);
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue {
                key: "DELTA_STREAM_URL".to_string(),
                reason: "must start with ws:// or wss://".to_string(),
            });
        }

        let instrument = var("DELTA_WATCH_INSTRUMENT").unwrap_or(defaults.instrument);
        if instrument.trim().is_empty() {
            return Err(ConfigError::EmptyValue("DELTA_WATCH_INSTRUMENT".to_string()));
        }

        let retention = var("DELTA_WATCH_RETENTION_HOURS")
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|hours| *hours > 0)
            .map(TimeDelta::hours);

        let reconnect = ReconnectSettings {
            delay_initial: parse_var_millis(
                &var,
                "DELTA_WATCH_RECONNECT_DELAY_INITIAL_MS",
                defaults.reconnect.delay_initial,
            ),
            delay_max: parse_var_secs(
                &var,
                "DELTA_WATCH_RECONNECT_DELAY_MAX_SECS",
                defaults.reconnect.delay_max,
            ),
            delay_multiplier: parse_var(
                &var,
                "DELTA_WATCH_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect.delay_multiplier,
            ),
            max_attempts: parse_var(
                &var,
                "DELTA_WATCH_RECONNECT_MAX_ATTEMPTS",
                defaults.reconnect.max_attempts,
            ),
        };

        Ok(Self {
            url,
            instrument,
            retention,
            liveness_timeout: parse_var_secs(
                &var,
                "DELTA_WATCH_LIVENESS_TIMEOUT_SECS",
                defaults.liveness_timeout,
            ),
            reconnect,
        })
    }
}

// =============================================================================
// Errors and Parsing
// =============================================================================

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has an unusable value.
    #[error("environment variable {key} is invalid: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },
}

fn parse_var<F, T>(var: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    var(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_var_secs<F>(var: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    var(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_var_millis<F>(var: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    var(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
