//! Logging setup with optional daily-rotated file output
//!
//! Filtering honors `RUST_LOG`; the configured level is the default
//! directive when it is unset.

use crate::config::LoggingSettings;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

const DEFAULT_LOG_FILE_NAME: &str = "moonraker-sync.log";

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,

    /// Log to a daily-rotated file
    pub file_path: Option<PathBuf>,

    /// Log to stderr
    pub stderr: bool,

    /// Include thread IDs
    pub thread_ids: bool,

    /// Emit JSON lines instead of text
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            file_path: None,
            stderr: true,
            thread_ids: false,
            json: false,
        }
    }
}

impl From<&LoggingSettings> for LogConfig {
    fn from(settings: &LoggingSettings) -> Self {
        Self {
            level: parse_level(&settings.level).unwrap_or(Level::INFO),
            file_path: settings.file.clone(),
            stderr: settings.stderr,
            thread_ids: false,
            json: settings.json,
        }
    }
}

impl LogConfig {
    /// Create config from environment
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Override fields from `RUST_LOG`, `MOONRAKER_LOG_FILE` and
    /// `MOONRAKER_LOG_STDERR`
    pub fn apply_env(&mut self) {
        if let Some(level) = std::env::var("RUST_LOG").ok().as_deref().and_then(parse_level) {
            self.level = level;
        }

        if let Ok(log_file) = std::env::var("MOONRAKER_LOG_FILE") {
            self.file_path = Some(PathBuf::from(log_file));
        }

        if let Ok(log_stderr) = std::env::var("MOONRAKER_LOG_STDERR") {
            self.stderr = log_stderr.to_lowercase() != "false";
        }
    }
}

/// Most verbose level named in a filter string
pub fn parse_level(filter: &str) -> Option<Level> {
    let filter = filter.to_lowercase();
    if filter.contains("trace") {
        Some(Level::TRACE)
    } else if filter.contains("debug") {
        Some(Level::DEBUG)
    } else if filter.contains("info") {
        Some(Level::INFO)
    } else if filter.contains("warn") {
        Some(Level::WARN)
    } else if filter.contains("error") {
        Some(Level::ERROR)
    } else {
        None
    }
}

/// Initialize the global subscriber
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.level.into())
        .from_env_lossy();

    let file_appender = match &config.file_path {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(directory)?;
            let file_name = path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new(DEFAULT_LOG_FILE_NAME));
            Some(tracing_appender::rolling::daily(directory, file_name))
        }
        None => None,
    };

    let (stderr_text, stderr_json) = match (config.stderr, config.json) {
        (true, false) => (
            Some(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_thread_ids(config.thread_ids)
                    .compact(),
            ),
            None,
        ),
        (true, true) => (
            None,
            Some(fmt::layer().with_writer(std::io::stderr).json()),
        ),
        (false, _) => (None, None),
    };

    let file_layer = file_appender.map(|appender| {
        fmt::layer()
            .with_writer(appender)
            .with_ansi(false)
            .with_thread_ids(config.thread_ids)
    });

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_text)
        .with(stderr_json)
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level("moonraker_sync=trace,tokio=warn"), Some(Level::TRACE));
        assert_eq!(parse_level("WARN"), Some(Level::WARN));
        assert_eq!(parse_level("off"), None);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        temp_env::with_vars(
            [
                ("RUST_LOG", Some("debug")),
                ("MOONRAKER_LOG_FILE", Some("/tmp/moonraker-sync/sync.log")),
                ("MOONRAKER_LOG_STDERR", Some("false")),
            ],
            || {
                let config = LogConfig::from_env();
                assert_eq!(config.level, Level::DEBUG);
                assert_eq!(
                    config.file_path,
                    Some(PathBuf::from("/tmp/moonraker-sync/sync.log"))
                );
                assert!(!config.stderr);
            },
        );
    }

    #[test]
    #[serial]
    fn test_defaults_without_env() {
        temp_env::with_vars_unset(
            ["RUST_LOG", "MOONRAKER_LOG_FILE", "MOONRAKER_LOG_STDERR"],
            || {
                let config = LogConfig::from_env();
                assert_eq!(config.level, Level::INFO);
                assert!(config.file_path.is_none());
                assert!(config.stderr);
            },
        );
    }
}
