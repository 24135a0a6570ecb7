//! Delivery settings: per-environment endpoints and the timing knobs of
//! push fallback and polling, read from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Deployment target; selects the default backend address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    /// Base address of the backend for this environment.
    pub fn base_url(self) -> &'static str {
        match self {
            Self::Development => "http://localhost:5000",
            Self::Staging => "https://staging-api.singwithme.app",
            Self::Production => "https://api.singwithme.app",
        }
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "staging" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            other => Err(ConfigError::UnknownEnvironment(other.to_string())),
        }
    }
}

/// Endpoints and timing for job-update delivery.
///
/// [`DeliveryConfig::default`] targets the development backend;
/// [`DeliveryConfig::from_env`] applies environment overrides.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub environment: Environment,
    /// HTTP API base, e.g. `http://localhost:5000/api`.
    pub api_url: String,
    /// Realtime WebSocket endpoint, e.g. `ws://localhost:5000/ws`.
    pub realtime_url: String,
    /// Push silence a monitor tolerates before polling.
    pub fallback_timeout: Duration,
    /// Handshake attempts per connect cycle.
    pub max_reconnect_attempts: u32,
    /// Fixed pause between handshake attempts.
    pub reconnect_delay: Duration,
    /// Upper bound on a single handshake attempt.
    pub handshake_timeout: Duration,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self::for_environment(Environment::default())
    }
}

impl DeliveryConfig {
    /// Defaults for the given environment.
    pub fn for_environment(environment: Environment) -> Self {
        let base = environment.base_url();
        Self {
            environment,
            api_url: format!("{base}/api"),
            realtime_url: realtime_url_for(base),
            fallback_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(1000),
            handshake_timeout: Duration::from_secs(20),
            poll_interval: Duration::from_secs(2),
            max_poll_attempts: 30,
        }
    }

    /// Load configuration from process environment variables.
    ///
    /// | Env Var                  | Default                          |
    /// |--------------------------|----------------------------------|
    /// | `APP_ENV`                | `development`                    |
    /// | `API_URL`                | `<environment base>/api`         |
    /// | `REALTIME_URL`           | `<environment base as ws>/ws`    |
    /// | `FALLBACK_TIMEOUT_SECS`  | `10`                             |
    /// | `MAX_RECONNECT_ATTEMPTS` | `5`                              |
    /// | `RECONNECT_DELAY_MS`     | `1000`                           |
    /// | `HANDSHAKE_TIMEOUT_SECS` | `20`                             |
    /// | `POLL_INTERVAL_SECS`     | `2`                              |
    /// | `MAX_POLL_ATTEMPTS`      | `30`                             |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable
    /// source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let environment = match lookup("APP_ENV") {
            Some(raw) => raw.parse()?,
            None => Environment::default(),
        };
        let mut config = Self::for_environment(environment);

        if let Some(url) = lookup("API_URL") {
            config.api_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = lookup("REALTIME_URL") {
            config.realtime_url = url.trim_end_matches('/').to_string();
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "FALLBACK_TIMEOUT_SECS", "u64")? {
            config.fallback_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var::<u32>(&lookup, "MAX_RECONNECT_ATTEMPTS", "u32")? {
            config.max_reconnect_attempts = n;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "RECONNECT_DELAY_MS", "u64")? {
            config.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "HANDSHAKE_TIMEOUT_SECS", "u64")? {
            config.handshake_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "POLL_INTERVAL_SECS", "u64")? {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var::<u32>(&lookup, "MAX_POLL_ATTEMPTS", "u32")? {
            config.max_poll_attempts = n;
        }

        Ok(config)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                var,
                expected,
                value,
            }),
    }
}

/// Derive the realtime endpoint from an HTTP base address.
fn realtime_url_for(base: &str) -> String {
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws_base}/ws")
}
