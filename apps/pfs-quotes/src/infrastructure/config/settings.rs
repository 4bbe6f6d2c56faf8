//! Client Configuration Settings
//!
//! Configuration types for the quote client, built in code or loaded from
//! environment variables.

use std::time::Duration;

/// Access id issued by the quote server operator.
///
/// Redacted in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessId(String);

impl AccessId {
    /// Wrap an access id.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is empty or whitespace.
    pub fn new(id: impl Into<String>) -> Result<Self, ConfigError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ConfigError::EmptyValue("access id".to_string()));
        }
        Ok(Self(id))
    }

    /// The raw id, for the open request only.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AccessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessId([REDACTED])")
    }
}

/// Connection, heartbeat, and timeout tuning.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// How long a ping may go unanswered before the connection is dropped.
    pub heartbeat_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Jitter applied to each reconnection delay, as a fraction.
    pub reconnect_jitter: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Bound on TCP connect plus WebSocket handshake.
    pub connect_timeout: Duration,
    /// Bound on waiting for the server to acknowledge the session.
    pub open_timeout: Duration,
    /// Bound on waiting for a snapshot response.
    pub snapshot_timeout: Duration,
    /// Capacity of the broadcast event stream.
    pub event_capacity: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(5),
            reconnect_delay_initial: Duration::from_secs(1),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            reconnect_jitter: 0.1,
            max_reconnect_attempts: 10,
            connect_timeout: Duration::from_secs(10),
            open_timeout: Duration::from_secs(10),
            snapshot_timeout: Duration::from_secs(15),
            event_capacity: 1_024,
        }
    }
}

impl ConnectionSettings {
    /// Check that every interval and timeout is non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroDuration`] naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("heartbeat interval", self.heartbeat_interval),
            ("heartbeat timeout", self.heartbeat_timeout),
            ("connect timeout", self.connect_timeout),
            ("open timeout", self.open_timeout),
            ("snapshot timeout", self.snapshot_timeout),
        ];
        match durations.iter().find(|(_, value)| value.is_zero()) {
            Some((name, _)) => Err(ConfigError::ZeroDuration((*name).to_string())),
            None => Ok(()),
        }
    }

    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            heartbeat_interval: parse_duration_secs(
                lookup,
                "PFS_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            ),
            heartbeat_timeout: parse_duration_secs(
                lookup,
                "PFS_HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat_timeout,
            ),
            reconnect_delay_initial: parse_duration_millis(
                lookup,
                "PFS_RECONNECT_DELAY_INITIAL_MS",
                defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_duration_secs(
                lookup,
                "PFS_RECONNECT_DELAY_MAX_SECS",
                defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_or(
                lookup,
                "PFS_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect_delay_multiplier,
            ),
            reconnect_jitter: defaults.reconnect_jitter,
            max_reconnect_attempts: parse_or(
                lookup,
                "PFS_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
            connect_timeout: parse_duration_secs(
                lookup,
                "PFS_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout,
            ),
            open_timeout: parse_duration_secs(lookup, "PFS_OPEN_TIMEOUT_SECS", defaults.open_timeout),
            snapshot_timeout: parse_duration_secs(
                lookup,
                "PFS_SNAPSHOT_TIMEOUT_SECS",
                defaults.snapshot_timeout,
            ),
            event_capacity: defaults.event_capacity,
        }
    }
}

/// Complete client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint (`ws://` or `wss://`).
    pub server_url: String,
    /// Access id used to open sessions.
    pub access_id: AccessId,
    /// Open query-only sessions instead of streaming ones.
    pub snapshot_mode: bool,
    /// Connection tuning.
    pub connection: ConnectionSettings,
}

impl ClientConfig {
    /// Build a configuration with default connection settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is not a WebSocket URL or the access id is empty.
    pub fn new(
        server_url: impl Into<String>,
        access_id: impl Into<String>,
        snapshot_mode: bool,
    ) -> Result<Self, ConfigError> {
        let server_url = server_url.into().trim().to_string();
        validate_url(&server_url)?;

        Ok(Self {
            server_url,
            access_id: AccessId::new(access_id)?,
            snapshot_mode,
            connection: ConnectionSettings::default(),
        })
    }

    /// Replace the connection settings.
    #[must_use]
    pub fn with_connection(mut self, connection: ConnectionSettings) -> Self {
        self.connection = connection;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// Required: `PFS_URL`, `PFS_ID`. Everything else falls back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if required keys are missing or invalid, or if a
    /// timing setting is zero.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let server_url = required(&lookup, "PFS_URL")?;
        let access_id = required(&lookup, "PFS_ID")?;
        let snapshot_mode = lookup("PFS_SNAPSHOT_MODE").is_some_and(|v| parse_bool(&v));
        let connection = ConnectionSettings::from_lookup(&lookup);
        connection.validate()?;

        Ok(Self::new(server_url, access_id, snapshot_mode)?.with_connection(connection))
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("{0} cannot be empty")]
    EmptyValue(String),
    /// Server URL is not a WebSocket URL.
    #[error("invalid server url {0:?}: expected ws:// or wss://")]
    InvalidUrl(String),
    /// An interval or timeout is zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(String),
}

fn validate_url(url: &str) -> Result<(), ConfigError> {
    let lower = url.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("wss://")
        .or_else(|| lower.strip_prefix("ws://"));
    match rest {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(ConfigError::InvalidUrl(url.to_string())),
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String, ConfigError> {
    let value = lookup(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
    if value.trim().is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(value)
}

/// Parse a boolean flag the way the demo environment files spell them.
#[must_use]
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_duration_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_duration_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
