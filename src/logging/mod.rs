//! Logging configuration and initialization
//!
//! Centralized logging setup using the `tracing` ecosystem, with
//! human-readable and JSON output formats configurable via environment
//! variables or programmatically.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: standard tracing filter (e.g. "info", "debug,unipool=trace")
//! - `UNIPOOL_LOG_LEVEL`: simple log level (error, warn, info, debug, trace)
//! - `UNIPOOL_LOG_FORMAT`: output format ("human" or "json")
//! - `UNIPOOL_LOG_FILE`: optional file path for JSON log output

use once_cell::sync::OnceCell;
use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Global flag to track if tracing has been initialized
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

const LOG_LEVEL_ENV: &str = "UNIPOOL_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "UNIPOOL_LOG_FORMAT";
const LOG_FILE_ENV: &str = "UNIPOOL_LOG_FILE";

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Invalid log level string provided
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    /// Failed to create log file directory
    #[error("failed to create log directory: {0}")]
    DirectoryCreationFailed(String),

    /// Failed to open log file
    #[error("failed to open log file: {0}")]
    FileOpenFailed(String),
}

/// Log level enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Log format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable output (default)
    #[default]
    Human,
    /// JSON structured output
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "human" | "pretty" | "console" => Some(LogFormat::Human),
            "json" | "structured" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Include file/line in log lines
    pub with_file_info: bool,
    /// Optional file path for JSON log output
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file_info(mut self, with_file_info: bool) -> Self {
        self.with_file_info = with_file_info;
        self
    }

    pub fn with_log_file(mut self, path: PathBuf) -> Self {
        self.log_file = Some(path);
        self
    }
}

/// Initialize logging from environment variables, falling back to defaults.
///
/// Idempotent: repeated calls initialize the subscriber once.
pub fn init_logging_from_env() {
    TRACING_INITIALIZED.get_or_init(|| {
        let level = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|s| LogLevel::parse(&s))
            .unwrap_or_default();
        let format = std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|s| LogFormat::parse(&s))
            .unwrap_or_default();

        let mut config = LoggingConfig::new().with_level(level).with_format(format);
        if let Some(file) = std::env::var(LOG_FILE_ENV).ok().map(PathBuf::from) {
            config = config.with_log_file(file);
        }

        let _ = init_internal(&config);
    });
}

/// Initialize logging with a custom configuration. Idempotent.
pub fn init_with_config(config: &LoggingConfig) {
    TRACING_INITIALIZED.get_or_init(|| {
        let _ = init_internal(config);
    });
}

/// Check if tracing has been initialized
pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}

fn init_internal(config: &LoggingConfig) -> Result<(), LoggingError> {
    let env_filter = build_env_filter(config.level)?;

    match (&config.format, &config.log_file) {
        (LogFormat::Json, None) => {
            let layer = fmt::layer()
                .json()
                .with_target(false)
                .with_file(config.with_file_info)
                .with_line_number(config.with_file_info);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .init();
        }
        (LogFormat::Human, None) => {
            let layer = fmt::layer()
                .with_target(true)
                .with_file(config.with_file_info)
                .with_line_number(config.with_file_info);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .init();
        }
        (_, Some(log_path)) => {
            // With a log file the console gets the human layer and the file
            // layer is always JSON for log aggregation
            if let Some(parent) = log_path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| LoggingError::DirectoryCreationFailed(e.to_string()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .map_err(|e| LoggingError::FileOpenFailed(e.to_string()))?;

            let console = fmt::layer().with_target(true);
            let file_layer = fmt::layer()
                .json()
                .with_writer(file)
                .with_target(false)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console)
                .with(file_layer)
                .init();
        }
    }

    Ok(())
}

/// Build the filter: `RUST_LOG` first (standard convention), then
/// `UNIPOOL_LOG_LEVEL`, then the configured default.
fn build_env_filter(default_level: LogLevel) -> Result<EnvFilter, LoggingError> {
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(rust_log)
            .map_err(|e| LoggingError::InvalidLogLevel(e.to_string()));
    }
    if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
        if let Some(level) = LogLevel::parse(&level) {
            return Ok(EnvFilter::new(level.as_filter_str()));
        }
    }
    Ok(EnvFilter::new(default_level.as_filter_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_logging_from_env();
        init_logging_from_env();
        assert!(is_initialized());
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("error"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("WARN"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("trace"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::parse("loud"), None);
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("human"), Some(LogFormat::Human));
        assert_eq!(LogFormat::parse("pretty"), Some(LogFormat::Human));
        assert_eq!(LogFormat::parse("json"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("xml"), None);
    }

    #[test]
    fn test_config_builder() {
        let config = LoggingConfig::new()
            .with_level(LogLevel::Debug)
            .with_format(LogFormat::Json)
            .with_file_info(true)
            .with_log_file(PathBuf::from("/tmp/unipool.log"));

        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.with_file_info);
        assert_eq!(config.log_file, Some(PathBuf::from("/tmp/unipool.log")));
    }
}
