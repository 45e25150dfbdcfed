//! Startup configuration
//!
//! The binary takes no flags. Everything is read once from the environment
//! before the hooks are attached; nothing is reconfigured while running.
//!
//! | Variable                          | Default | Meaning                               |
//! |-----------------------------------|---------|---------------------------------------|
//! | `SYNGUARD_TABLE_CAPACITY`         | 10240   | max staged block decisions            |
//! | `SYNGUARD_EXPORT`                 | off     | mirror block decisions to stdout      |
//! | `SYNGUARD_EXPORT_FORMAT`          | text    | `text` or `json`                      |
//! | `SYNGUARD_POLL_INTERVAL_MS`       | 100     | export/metrics poll interval          |
//! | `SYNGUARD_HANDSHAKE_WINDOW_SECS`  | 75      | age after which a decision is stale   |
//! | `SYNGUARD_OTLP_ENDPOINT`          | unset   | export tracing spans over OTLP        |

use std::fmt;
use std::time::Duration;

use crate::filter::{EventFormat, DEFAULT_HANDSHAKE_WINDOW};

pub const ENV_TABLE_CAPACITY: &str = "SYNGUARD_TABLE_CAPACITY";
pub const ENV_EXPORT: &str = "SYNGUARD_EXPORT";
pub const ENV_EXPORT_FORMAT: &str = "SYNGUARD_EXPORT_FORMAT";
pub const ENV_POLL_INTERVAL_MS: &str = "SYNGUARD_POLL_INTERVAL_MS";
pub const ENV_HANDSHAKE_WINDOW_SECS: &str = "SYNGUARD_HANDSHAKE_WINDOW_SECS";
pub const ENV_OTLP_ENDPOINT: &str = "SYNGUARD_OTLP_ENDPOINT";

/// Default table capacity (same as a BCC BPF_HASH default)
pub const DEFAULT_TABLE_CAPACITY: u32 = 10240;

/// Configuration for the filter and its supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterConfig {
    /// Maximum number of staged block decisions
    pub table_capacity: u32,
    /// Whether block decisions are exported to userspace
    pub export_enabled: bool,
    /// Line format for exported events
    pub export_format: EventFormat,
    /// How often the supervisor polls for events and counters
    pub poll_interval: Duration,
    /// Decisions older than this are treated as stale
    pub handshake_window: Duration,
    /// OTLP collector endpoint for tracing spans
    pub otlp_endpoint: Option<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            table_capacity: DEFAULT_TABLE_CAPACITY,
            export_enabled: false,
            export_format: EventFormat::Text,
            poll_interval: Duration::from_millis(100),
            handshake_window: DEFAULT_HANDSHAKE_WINDOW,
            otlp_endpoint: None,
        }
    }
}

/// Error type for configuration loading
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Variable present but not parseable
    Invalid { var: &'static str, value: String },
    /// Parsed value outside the accepted range
    OutOfRange { var: &'static str, reason: &'static str },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid value for {}: {:?}", var, value),
            ConfigError::OutOfRange { var, reason } => write!(f, "{} {}", var, reason),
        }
    }
}

impl std::error::Error for ConfigError {}

impl FilterConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load using an arbitrary variable lookup; unset variables keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_TABLE_CAPACITY) {
            config.table_capacity = parse(ENV_TABLE_CAPACITY, &value)?;
        }
        if let Some(value) = lookup(ENV_EXPORT) {
            config.export_enabled = parse_bool(ENV_EXPORT, &value)?;
        }
        if let Some(value) = lookup(ENV_EXPORT_FORMAT) {
            config.export_format = EventFormat::parse(&value).ok_or(ConfigError::Invalid {
                var: ENV_EXPORT_FORMAT,
                value,
            })?;
        }
        if let Some(value) = lookup(ENV_POLL_INTERVAL_MS) {
            config.poll_interval = Duration::from_millis(parse(ENV_POLL_INTERVAL_MS, &value)?);
        }
        if let Some(value) = lookup(ENV_HANDSHAKE_WINDOW_SECS) {
            config.handshake_window = Duration::from_secs(parse(ENV_HANDSHAKE_WINDOW_SECS, &value)?);
        }
        config.otlp_endpoint = lookup(ENV_OTLP_ENDPOINT).filter(|s| !s.trim().is_empty());

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.table_capacity == 0 {
            return Err(ConfigError::OutOfRange {
                var: ENV_TABLE_CAPACITY,
                reason: "must be greater than zero",
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::OutOfRange {
                var: ENV_POLL_INTERVAL_MS,
                reason: "must be greater than zero",
            });
        }
        if self.handshake_window.is_zero() {
            return Err(ConfigError::OutOfRange {
                var: ENV_HANDSHAKE_WINDOW_SECS,
                reason: "must be greater than zero",
            });
        }
        // The kernel keeps the window as u64 nanoseconds
        if u64::try_from(self.handshake_window.as_nanos()).is_err() {
            return Err(ConfigError::OutOfRange {
                var: ENV_HANDSHAKE_WINDOW_SECS,
                reason: "must fit in 64-bit nanoseconds",
            });
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
    })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = FilterConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, FilterConfig::default());
        assert_eq!(config.table_capacity, 10240);
        assert!(!config.export_enabled);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.handshake_window, Duration::from_secs(75));
    }

    #[test]
    fn test_overrides() {
        let config = FilterConfig::from_lookup(lookup(&[
            (ENV_TABLE_CAPACITY, "64"),
            (ENV_EXPORT, "on"),
            (ENV_EXPORT_FORMAT, "json"),
            (ENV_POLL_INTERVAL_MS, "250"),
            (ENV_HANDSHAKE_WINDOW_SECS, "30"),
            (ENV_OTLP_ENDPOINT, "http://collector:4317"),
        ]))
        .unwrap();

        assert_eq!(config.table_capacity, 64);
        assert!(config.export_enabled);
        assert_eq!(config.export_format, EventFormat::Json);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.handshake_window, Duration::from_secs(30));
        assert_eq!(config.otlp_endpoint.as_deref(), Some("http://collector:4317"));
    }

    #[test]
    fn test_rejects_garbage_and_zero() {
        assert!(matches!(
            FilterConfig::from_lookup(lookup(&[(ENV_TABLE_CAPACITY, "lots")])),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            FilterConfig::from_lookup(lookup(&[(ENV_TABLE_CAPACITY, "0")])),
            Err(ConfigError::OutOfRange { .. })
        ));
        assert!(matches!(
            FilterConfig::from_lookup(lookup(&[(ENV_EXPORT, "maybe")])),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            FilterConfig::from_lookup(lookup(&[(ENV_POLL_INTERVAL_MS, "0")])),
            Err(ConfigError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_rejects_window_beyond_u64_nanos() {
        // One second past u64::MAX nanoseconds; would wrap to ~0.29s if cast
        let err = FilterConfig::from_lookup(lookup(&[(ENV_HANDSHAKE_WINDOW_SECS, "18446744074")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::OutOfRange {
                var: ENV_HANDSHAKE_WINDOW_SECS,
                reason: "must fit in 64-bit nanoseconds",
            }
        );

        let config =
            FilterConfig::from_lookup(lookup(&[(ENV_HANDSHAKE_WINDOW_SECS, "18446744073")])).unwrap();
        assert_eq!(config.handshake_window, Duration::from_secs(18_446_744_073));
    }
}
