/// Configuration for olap-delta.
///
/// Defaults suit a single local process. Every value can be overridden
/// from a JSON file ([`OlapConfig::from_file`]) and then from environment
/// variables ([`OlapConfig::with_env`]):
///
/// | Variable | Field |
/// |---|---|
/// | `OLAP_PREFIX` | `storage.prefix` |
/// | `OLAP_RETRY_INTERVAL_MS` | `storage.retry_interval_ms` |
/// | `OLAP_MAX_RETRY_INTERVAL_MS` | `storage.max_retry_interval_ms` |
/// | `OLAP_UPDATE_INTERVAL_MS` | `coordinator.update_interval_ms` |
/// | `OLAP_PULL_LIMIT` | `feed.pull_limit` |
/// | `LOG_LEVEL` | `logger.level` |
/// | `LOG_DEST` | `logger.dest` |
/// | `LOG_FILEPATH` | `logger.file_path` |
use crate::error::{OlapError, OlapResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Storage-side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageConfig {
    /// Prefix of every cube collection name.
    pub prefix: String,
    /// First delay between connection attempts.
    pub retry_interval_ms: u64,
    /// Upper bound of the delay between connection attempts.
    pub max_retry_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            prefix: "olap".to_string(),
            retry_interval_ms: 1000,
            max_retry_interval_ms: 30_000,
        }
    }
}

/// Change-feed settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FeedConfig {
    /// Maximum events per pull when not buffering (unbounded if `None`).
    pub pull_limit: Option<usize>,
}

/// Coordinator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoordinatorConfig {
    /// Default period of automatic updates.
    pub update_interval_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 30_000,
        }
    }
}

/// Where log output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogDest {
    #[default]
    Console,
    File,
}

/// Logger settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggerConfig {
    /// Level filter, e.g. `info` or `olap_delta=debug`.
    pub level: String,
    pub dest: LogDest,
    /// Log file when `dest` is `file`.
    pub file_path: PathBuf,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dest: LogDest::Console,
            file_path: PathBuf::from("olap-delta.log"),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OlapConfig {
    pub storage: StorageConfig,
    pub feed: FeedConfig,
    pub coordinator: CoordinatorConfig,
    pub logger: LoggerConfig,
}

impl OlapConfig {
    /// Create a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a JSON config file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> OlapResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            OlapError::validation(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Overlay the process environment.
    pub fn with_env(self) -> Self {
        self.with_vars(|key| std::env::var(key).ok())
    }

    /// Overlay values looked up through `var`.
    ///
    /// Unparseable numbers are ignored with a warning.
    pub fn with_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        fn number<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "ignoring unparseable setting");
                    None
                }
            }
        }

        if let Some(prefix) = var("OLAP_PREFIX") {
            self.storage.prefix = prefix;
        }
        if let Some(ms) = number("OLAP_RETRY_INTERVAL_MS", var("OLAP_RETRY_INTERVAL_MS")) {
            self.storage.retry_interval_ms = ms;
        }
        if let Some(ms) = number("OLAP_MAX_RETRY_INTERVAL_MS", var("OLAP_MAX_RETRY_INTERVAL_MS")) {
            self.storage.max_retry_interval_ms = ms;
        }
        if let Some(ms) = number("OLAP_UPDATE_INTERVAL_MS", var("OLAP_UPDATE_INTERVAL_MS")) {
            self.coordinator.update_interval_ms = ms;
        }
        if let Some(limit) = number("OLAP_PULL_LIMIT", var("OLAP_PULL_LIMIT")) {
            self.feed.pull_limit = Some(limit);
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.logger.level = level;
        }
        match var("LOG_DEST").as_deref() {
            Some("file") => self.logger.dest = LogDest::File,
            Some("console") => self.logger.dest = LogDest::Console,
            Some(other) => tracing::warn!(value = other, "ignoring unknown LOG_DEST"),
            None => {}
        }
        if let Some(path) = var("LOG_FILEPATH") {
            self.logger.file_path = PathBuf::from(path);
        }
        self
    }

    /// Set the collection prefix.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.storage.prefix = prefix.into();
        self
    }

    /// Set the connection retry bounds.
    pub fn retry(mut self, initial: Duration, max: Duration) -> Self {
        self.storage.retry_interval_ms = duration_ms(initial);
        self.storage.max_retry_interval_ms = duration_ms(max);
        self
    }

    /// Set the default auto-update period.
    pub fn update_interval(mut self, interval: Duration) -> Self {
        self.coordinator.update_interval_ms = duration_ms(interval);
        self
    }

    /// Bound the number of events per pull.
    pub fn pull_limit(mut self, limit: usize) -> Self {
        self.feed.pull_limit = Some(limit);
        self
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.storage.retry_interval_ms)
    }

    pub fn max_retry_interval(&self) -> Duration {
        Duration::from_millis(self.storage.max_retry_interval_ms.max(self.storage.retry_interval_ms))
    }

    pub fn default_update_interval(&self) -> Duration {
        Duration::from_millis(self.coordinator.update_interval_ms)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = OlapConfig::new();
        assert_eq!(config.storage.prefix, "olap");
        assert_eq!(config.retry_interval(), Duration::from_secs(1));
        assert_eq!(config.max_retry_interval(), Duration::from_secs(30));
        assert_eq!(config.default_update_interval(), Duration::from_secs(30));
        assert_eq!(config.logger.level, "info");
        assert_eq!(config.logger.dest, LogDest::Console);
        assert_eq!(config.feed.pull_limit, None);
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("OLAP_PREFIX", "cubes"),
            ("OLAP_RETRY_INTERVAL_MS", "250"),
            ("OLAP_UPDATE_INTERVAL_MS", "not-a-number"),
            ("OLAP_PULL_LIMIT", "500"),
            ("LOG_DEST", "file"),
            ("LOG_FILEPATH", "/tmp/olap.log"),
        ]
        .into_iter()
        .collect();

        let config = OlapConfig::new().with_vars(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.storage.prefix, "cubes");
        assert_eq!(config.storage.retry_interval_ms, 250);
        assert_eq!(config.coordinator.update_interval_ms, 30_000);
        assert_eq!(config.feed.pull_limit, Some(500));
        assert_eq!(config.logger.dest, LogDest::File);
        assert_eq!(config.logger.file_path, PathBuf::from("/tmp/olap.log"));
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"storage": {{"prefix": "x"}}, "logger": {{"level": "debug"}}}}"#).unwrap();

        let config = OlapConfig::from_file(file.path()).unwrap();
        assert_eq!(config.storage.prefix, "x");
        assert_eq!(config.storage.retry_interval_ms, 1000);
        assert_eq!(config.logger.level, "debug");
    }

    #[test]
    fn test_builders() {
        let config = OlapConfig::new()
            .prefix("p")
            .retry(Duration::from_millis(10), Duration::from_millis(5))
            .update_interval(Duration::from_millis(100))
            .pull_limit(7);
        assert_eq!(config.storage.prefix, "p");
        assert_eq!(config.max_retry_interval(), Duration::from_millis(10));
        assert_eq!(config.default_update_interval(), Duration::from_millis(100));
        assert_eq!(config.feed.pull_limit, Some(7));
    }
}
