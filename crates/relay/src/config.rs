// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Every knob is range-checked by `RelayConfig::validate`
// before the server starts.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

pub const DEV_JWT_SECRET: &str = "erdsync_local_development_jwt_secret_must_be_32_chars";

/// Deployment environment. Decides the counter-store degraded policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" | "test" => Some(Self::Development),
            "production" | "prod" => Some(Self::Production),
            _ => None,
        }
    }

    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u64,
    pub backoff_multiplier: u32,
    pub error_threshold: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(60_000),
            max_requests: 1_000,
            backoff_multiplier: 2,
            error_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceConfig {
    pub ttl: Duration,
    pub sweep_interval: Duration,
    pub update_window: Duration,
    pub update_max: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(300_000),
            sweep_interval: Duration::from_millis(60_000),
            update_window: Duration::from_millis(5_000),
            update_max: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorConfig {
    pub throttle_window: Duration,
    pub timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            throttle_window: Duration::from_millis(50),
            timeout: Duration::from_millis(300_000),
            sweep_interval: Duration::from_millis(60_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub sync_debounce: Duration,
    pub persist_debounce: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sync_debounce: Duration::from_millis(50),
            persist_debounce: Duration::from_millis(2_000),
        }
    }
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub environment: Environment,
    pub jwt_secret: String,
    pub heartbeat_interval: Duration,
    pub ping_timeout: Duration,
    pub max_clients_per_workspace: usize,
    pub max_frame_bytes: usize,
    pub malformed_message_limit: u32,
    pub rate_limit: RateLimitConfig,
    pub presence: PresenceConfig,
    pub cursor: CursorConfig,
    pub session: SessionConfig,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `erdsync_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be a number, got '{value}'")]
    NotANumber { name: &'static str, value: String },
    #[error("{name} must be within {min}..={max}, got {value}")]
    OutOfRange { name: &'static str, value: u64, min: u64, max: u64 },
    #[error("{name} is too large, got {value}")]
    TooLarge { name: &'static str, value: u64 },
    #[error("unknown environment '{0}' (expected development or production)")]
    UnknownEnvironment(String),
    #[error("jwt secret must be at least 32 characters long")]
    JwtSecretTooShort,
    #[error("production deployments must set ERDSYNC_RELAY_JWT_SECRET")]
    DevSecretInProduction,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            environment: Environment::Development,
            jwt_secret: DEV_JWT_SECRET.to_string(),
            heartbeat_interval: Duration::from_millis(30_000),
            ping_timeout: Duration::from_millis(20_000),
            max_clients_per_workspace: 25,
            max_frame_bytes: 262_144,
            malformed_message_limit: 10,
            rate_limit: RateLimitConfig::default(),
            presence: PresenceConfig::default(),
            cursor: CursorConfig::default(),
            session: SessionConfig::default(),
            cors_origins: None,
            log_filter: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `ERDSYNC_RELAY_HOST` | `0.0.0.0` |
    /// | `ERDSYNC_RELAY_PORT` | `8080` |
    /// | `ERDSYNC_RELAY_ENV` | `development` |
    /// | `ERDSYNC_RELAY_JWT_SECRET` | dev-only placeholder |
    /// | `ERDSYNC_RELAY_HEARTBEAT_INTERVAL_MS` | `30000` |
    /// | `ERDSYNC_RELAY_PING_TIMEOUT_MS` | `20000` |
    /// | `ERDSYNC_RELAY_MAX_CLIENTS_PER_WORKSPACE` | `25` |
    /// | `ERDSYNC_RELAY_RATE_LIMIT_*` | 60s window, 1000 max, x2 backoff, 5 errors |
    /// | `ERDSYNC_RELAY_PRESENCE_*` | 5 min TTL, 60s sweep, 10 updates / 5s |
    /// | `ERDSYNC_RELAY_CURSOR_*` | 50ms throttle, 5 min timeout |
    /// | `ERDSYNC_RELAY_SYNC_DEBOUNCE_MS` | `50` |
    /// | `ERDSYNC_RELAY_PERSIST_DEBOUNCE_MS` | `2000` |
    /// | `ERDSYNC_RELAY_LOG_FILTER` | `info` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub(crate) fn from_env_fn<F>(env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let defaults = Self::default();
        let lookup = |name: &'static str| env(&format!("ERDSYNC_RELAY_{name}")).ok();

        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = lookup("PORT").and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let environment = match lookup("ENV") {
            Some(raw) => Environment::parse(&raw).ok_or(ConfigError::UnknownEnvironment(raw))?,
            None => Environment::Development,
        };

        let millis = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(Duration::from_millis(number(name, lookup(name), default.as_millis() as u64)?))
        };

        let config = Self {
            listen_addr,
            environment,
            jwt_secret: lookup("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            heartbeat_interval: millis("HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval)?,
            ping_timeout: millis("PING_TIMEOUT_MS", defaults.ping_timeout)?,
            max_clients_per_workspace: bounded(
                "MAX_CLIENTS_PER_WORKSPACE",
                lookup("MAX_CLIENTS_PER_WORKSPACE"),
                defaults.max_clients_per_workspace as u64,
            )?,
            max_frame_bytes: bounded(
                "MAX_FRAME_BYTES",
                lookup("MAX_FRAME_BYTES"),
                defaults.max_frame_bytes as u64,
            )?,
            malformed_message_limit: bounded(
                "MALFORMED_MESSAGE_LIMIT",
                lookup("MALFORMED_MESSAGE_LIMIT"),
                u64::from(defaults.malformed_message_limit),
            )?,
            rate_limit: RateLimitConfig {
                window: millis("RATE_LIMIT_WINDOW_MS", defaults.rate_limit.window)?,
                max_requests: number(
                    "RATE_LIMIT_MAX",
                    lookup("RATE_LIMIT_MAX"),
                    defaults.rate_limit.max_requests,
                )?,
                backoff_multiplier: bounded(
                    "RATE_LIMIT_BACKOFF_MULTIPLIER",
                    lookup("RATE_LIMIT_BACKOFF_MULTIPLIER"),
                    u64::from(defaults.rate_limit.backoff_multiplier),
                )?,
                error_threshold: bounded(
                    "RATE_LIMIT_ERROR_THRESHOLD",
                    lookup("RATE_LIMIT_ERROR_THRESHOLD"),
                    u64::from(defaults.rate_limit.error_threshold),
                )?,
            },
            presence: PresenceConfig {
                ttl: millis("PRESENCE_TTL_MS", defaults.presence.ttl)?,
                sweep_interval: millis(
                    "PRESENCE_SWEEP_INTERVAL_MS",
                    defaults.presence.sweep_interval,
                )?,
                update_window: millis(
                    "PRESENCE_UPDATE_WINDOW_MS",
                    defaults.presence.update_window,
                )?,
                update_max: number(
                    "PRESENCE_UPDATE_MAX",
                    lookup("PRESENCE_UPDATE_MAX"),
                    defaults.presence.update_max,
                )?,
            },
            cursor: CursorConfig {
                throttle_window: millis("CURSOR_THROTTLE_MS", defaults.cursor.throttle_window)?,
                timeout: millis("CURSOR_TIMEOUT_MS", defaults.cursor.timeout)?,
                sweep_interval: millis(
                    "CURSOR_SWEEP_INTERVAL_MS",
                    defaults.cursor.sweep_interval,
                )?,
            },
            session: SessionConfig {
                sync_debounce: millis("SYNC_DEBOUNCE_MS", defaults.session.sync_debounce)?,
                persist_debounce: millis(
                    "PERSIST_DEBOUNCE_MS",
                    defaults.session.persist_debounce,
                )?,
            },
            cors_origins: lookup("CORS_ORIGINS"),
            log_filter: lookup("LOG_FILTER").unwrap_or(defaults.log_filter),
            log_format: match lookup("LOG_FORMAT").as_deref() {
                Some("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Range-check every tunable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        in_range("HEARTBEAT_INTERVAL_MS", self.heartbeat_interval.as_millis() as u64, 5_000, 60_000)?;
        in_range("PING_TIMEOUT_MS", self.ping_timeout.as_millis() as u64, 1_000, 60_000)?;
        in_range("MAX_CLIENTS_PER_WORKSPACE", self.max_clients_per_workspace as u64, 1, 100)?;
        in_range("MAX_FRAME_BYTES", self.max_frame_bytes as u64, 1_024, 16 * 1024 * 1024)?;
        in_range("MALFORMED_MESSAGE_LIMIT", u64::from(self.malformed_message_limit), 1, 10_000)?;
        in_range("RATE_LIMIT_WINDOW_MS", self.rate_limit.window.as_millis() as u64, 1_000, 3_600_000)?;
        in_range("RATE_LIMIT_MAX", self.rate_limit.max_requests, 1, u64::from(u32::MAX))?;
        in_range(
            "RATE_LIMIT_BACKOFF_MULTIPLIER",
            u64::from(self.rate_limit.backoff_multiplier),
            1,
            60,
        )?;
        in_range("RATE_LIMIT_ERROR_THRESHOLD", u64::from(self.rate_limit.error_threshold), 1, 1_000)?;
        in_range("PRESENCE_TTL_MS", self.presence.ttl.as_millis() as u64, 1_000, 86_400_000)?;
        in_range(
            "PRESENCE_SWEEP_INTERVAL_MS",
            self.presence.sweep_interval.as_millis() as u64,
            100,
            3_600_000,
        )?;
        in_range(
            "PRESENCE_UPDATE_WINDOW_MS",
            self.presence.update_window.as_millis() as u64,
            1,
            3_600_000,
        )?;
        in_range("PRESENCE_UPDATE_MAX", self.presence.update_max, 1, 100_000)?;
        in_range("CURSOR_THROTTLE_MS", self.cursor.throttle_window.as_millis() as u64, 10, 1_000)?;
        in_range("CURSOR_TIMEOUT_MS", self.cursor.timeout.as_millis() as u64, 1_000, 86_400_000)?;
        in_range(
            "CURSOR_SWEEP_INTERVAL_MS",
            self.cursor.sweep_interval.as_millis() as u64,
            100,
            3_600_000,
        )?;
        in_range("SYNC_DEBOUNCE_MS", self.session.sync_debounce.as_millis() as u64, 0, 1_000)?;
        in_range(
            "PERSIST_DEBOUNCE_MS",
            self.session.persist_debounce.as_millis() as u64,
            100,
            60_000,
        )?;

        if self.jwt_secret.len() < 32 {
            return Err(ConfigError::JwtSecretTooShort);
        }
        if self.environment.is_production() && self.is_dev_jwt_secret() {
            return Err(ConfigError::DevSecretInProduction);
        }
        Ok(())
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }

    /// Connections silent for longer than this are terminated.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}

fn number(name: &'static str, raw: Option<String>, default: u64) -> Result<u64, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map_err(|_| ConfigError::NotANumber { name, value }),
    }
}

/// Parse into a narrower integer, refusing values that would not fit.
fn bounded<T: TryFrom<u64>>(
    name: &'static str,
    raw: Option<String>,
    default: u64,
) -> Result<T, ConfigError> {
    let value = number(name, raw, default)?;
    T::try_from(value).map_err(|_| ConfigError::TooLarge { name, value })
}

fn in_range(name: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { name, value, min, max })
    }
}
