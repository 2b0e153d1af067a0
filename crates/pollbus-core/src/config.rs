//! Bus configuration.
//!
//! Values come from defaults, then an optional TOML file, then `POLLBUS_*`
//! environment variables. The CLI applies its own flags last.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{BusError, BusResult};

const DEFAULT_MIN_RETAINED: usize = 4096;
const DEFAULT_MAX_RETAINED: usize = 65_536;
const DEFAULT_MAX_AGE_SECS: u64 = 300;
const DEFAULT_TRIM_INTERVAL_SECS: u64 = 30;
const DEFAULT_POLL_TIMEOUT_SECS: u64 = 50;
const DEFAULT_MAX_POLL_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MAX_BACKLOG: usize = 1024;
const DEFAULT_RESYNC_INTERVAL_MS: u64 = 500;
const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 30;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 120;

/// Notification log retention knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Newest entries always kept regardless of age.
    pub min_retained: usize,
    /// Hard cap on retained entries.
    pub max_retained: usize,
    /// Entries beyond `min_retained` older than this are dropped.
    pub max_age_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            min_retained: DEFAULT_MIN_RETAINED,
            max_retained: DEFAULT_MAX_RETAINED,
            max_age_secs: DEFAULT_MAX_AGE_SECS,
        }
    }
}

impl RetentionConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

/// Streaming session timers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub resync_interval_ms: u64,
    pub keepalive_interval_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            resync_interval_ms: DEFAULT_RESYNC_INTERVAL_MS,
            keepalive_interval_secs: DEFAULT_KEEPALIVE_INTERVAL_SECS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
        }
    }
}

impl SessionConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Top-level bus configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub trim_interval_secs: u64,
    /// Long-poll timeout used when the caller does not pick one.
    pub poll_timeout_secs: u64,
    /// Upper bound applied to any requested poll timeout.
    pub max_poll_timeout_secs: u64,
    /// Pending notifications a consumer may accumulate before it is closed.
    pub max_backlog: usize,
    pub retention: RetentionConfig,
    pub session: SessionConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            trim_interval_secs: DEFAULT_TRIM_INTERVAL_SECS,
            poll_timeout_secs: DEFAULT_POLL_TIMEOUT_SECS,
            max_poll_timeout_secs: DEFAULT_MAX_POLL_TIMEOUT_SECS,
            max_backlog: DEFAULT_MAX_BACKLOG,
            retention: RetentionConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl BusConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> BusResult<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn from_file(path: &Path) -> BusResult<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Load from an optional file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> BusResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `POLLBUS_*` overrides using the given lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> BusResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_from(&lookup, "POLLBUS_MIN_RETAINED", &mut self.retention.min_retained)?;
        override_from(&lookup, "POLLBUS_MAX_RETAINED", &mut self.retention.max_retained)?;
        override_from(&lookup, "POLLBUS_MAX_AGE_SECS", &mut self.retention.max_age_secs)?;
        override_from(&lookup, "POLLBUS_TRIM_INTERVAL_SECS", &mut self.trim_interval_secs)?;
        override_from(&lookup, "POLLBUS_POLL_TIMEOUT_SECS", &mut self.poll_timeout_secs)?;
        override_from(&lookup, "POLLBUS_MAX_POLL_TIMEOUT_SECS", &mut self.max_poll_timeout_secs)?;
        override_from(&lookup, "POLLBUS_MAX_BACKLOG", &mut self.max_backlog)?;
        override_from(&lookup, "POLLBUS_RESYNC_INTERVAL_MS", &mut self.session.resync_interval_ms)?;
        override_from(
            &lookup,
            "POLLBUS_KEEPALIVE_INTERVAL_SECS",
            &mut self.session.keepalive_interval_secs,
        )?;
        override_from(&lookup, "POLLBUS_IDLE_TIMEOUT_SECS", &mut self.session.idle_timeout_secs)?;
        Ok(())
    }

    pub fn validate(&self) -> BusResult<()> {
        if self.retention.max_retained < self.retention.min_retained {
            return Err(BusError::config(format!(
                "retention.max_retained ({}) must be >= retention.min_retained ({})",
                self.retention.max_retained, self.retention.min_retained
            )));
        }
        if self.max_backlog == 0 {
            return Err(BusError::config("max_backlog must be greater than zero"));
        }
        if self.trim_interval_secs == 0 || self.session.resync_interval_ms == 0 {
            return Err(BusError::config("tick intervals must be greater than zero"));
        }
        if self.session.keepalive_interval_secs == 0 {
            return Err(BusError::config("session.keepalive_interval_secs must be greater than zero"));
        }
        Ok(())
    }

    pub fn trim_interval(&self) -> Duration {
        Duration::from_secs(self.trim_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn max_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.max_poll_timeout_secs)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml_string(&self) -> BusResult<String> {
        toml::to_string_pretty(self).map_err(|e| BusError::config(e.to_string()))
    }
}

fn override_from<T, F>(lookup: &F, key: &str, target: &mut T) -> BusResult<()>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| BusError::config(format!("{key}: cannot parse '{raw}'")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = BusConfig::default();
        config.validate().unwrap();
        assert_eq!(config.poll_timeout(), Duration::from_secs(50));
        assert_eq!(config.session.resync_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = BusConfig::from_toml_str(
            r#"
            max_backlog = 16

            [retention]
            min_retained = 10
            max_retained = 20
            "#,
        )
        .unwrap();
        assert_eq!(config.max_backlog, 16);
        assert_eq!(config.retention.min_retained, 10);
        assert_eq!(config.retention.max_age_secs, DEFAULT_MAX_AGE_SECS);
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_invalid_retention_rejected() {
        let err = BusConfig::from_toml_str("[retention]\nmin_retained = 10\nmax_retained = 5\n")
            .unwrap_err();
        assert!(matches!(err, BusError::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> =
            [("POLLBUS_MAX_BACKLOG", "8"), ("POLLBUS_RESYNC_INTERVAL_MS", "25")].into();
        let mut config = BusConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.max_backlog, 8);
        assert_eq!(config.session.resync_interval_ms, 25);

        let bad: HashMap<&str, &str> = [("POLLBUS_MAX_BACKLOG", "lots")].into();
        assert!(config
            .apply_env(|key| bad.get(key).map(|v| v.to_string()))
            .is_err());
    }

    #[test]
    fn test_toml_round_trip_of_effective_config() {
        let rendered = BusConfig::default().to_toml_string().unwrap();
        assert!(rendered.contains("[retention]"));
        assert_eq!(BusConfig::from_toml_str(&rendered).unwrap(), BusConfig::default());
    }
}
