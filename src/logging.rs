/// Logging setup.
///
/// Installs a `tracing-subscriber` fmt subscriber. `RUST_LOG` wins when set;
/// otherwise the configured level applies. Installing twice is a no-op, so
/// tests and embedding applications can call [`init`] freely.
use crate::config::{LogDest, LoggerConfig};
use crate::error::{OlapError, OlapResult};
use std::fs::OpenOptions;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Build the level filter for `config`.
pub fn env_filter(config: &LoggerConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// Returns `Ok(false)` if a subscriber was already installed.
pub fn init(config: &LoggerConfig) -> OlapResult<bool> {
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter(config));

    let installed = match config.dest {
        LogDest::Console => builder.try_init().is_ok(),
        LogDest::File => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.file_path)
                .map_err(|e| {
                    OlapError::validation(format!(
                        "cannot open log file {}: {}",
                        config.file_path.display(),
                        e
                    ))
                })?;
            builder
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .try_init()
                .is_ok()
        }
    };

    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_level_falls_back() {
        let config = LoggerConfig {
            level: "[[not a filter".to_string(),
            ..LoggerConfig::default()
        };
        // Must not panic.
        let _ = env_filter(&config);
    }

    #[test]
    fn test_file_destination_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggerConfig {
            level: "debug".to_string(),
            dest: LogDest::File,
            file_path: dir.path().join("olap.log"),
        };

        init(&config).unwrap();
        assert!(config.file_path.exists());
        // Second install is refused quietly.
        assert!(!init(&config).unwrap());
    }
}
