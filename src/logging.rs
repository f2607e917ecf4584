//! Logging infrastructure for fbuild.
//!
//! # Environment Variables
//!
//! - `FBUILD_LOG` - Log filter (overrides RUST_LOG)
//! - `FBUILD_LOG_FORMAT` - Output format: pretty, compact, json
//! - `FBUILD_LOG_FILE` - Path to log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)

use std::path::PathBuf;
use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty format (default)
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: INFO)
    pub level: Level,
    /// Log format (default: Pretty)
    pub format: LogFormat,
    /// Path to log file (None = stderr only)
    pub file_path: Option<PathBuf>,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Create a new LogConfig with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the log level.
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// CLI-derived settings take precedence: a filter already set (e.g. from
    /// `-distverbose`) is not replaced by `FBUILD_LOG` or `RUST_LOG`.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("FBUILD_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if let Ok(format) = std::env::var("FBUILD_LOG_FORMAT") {
            if let Ok(f) = format.parse() {
                self.format = f;
            }
        }

        if let Ok(path) = std::env::var("FBUILD_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        if let Some(ref filter) = self.filter {
            EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                EnvFilter::new(format!("{}", self.level).to_lowercase())
            })
        } else {
            EnvFilter::new(format!("{}", self.level).to_lowercase())
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// This should be called once at program startup. Subsequent calls are
/// silently ignored.
pub fn init(config: LogConfig) {
    let filter = config.build_filter();

    let file_appender = config.file_path.as_ref().map(|path| {
        let parent = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("fbuild.log");
        tracing_appender::rolling::never(parent, file_name)
    });

    let result = match (config.format, file_appender) {
        (LogFormat::Json, Some(appender)) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(fmt::layer().json().with_ansi(false).with_writer(appender))
            .try_init(),
        (LogFormat::Json, None) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        (LogFormat::Compact, Some(appender)) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(false)
                    .with_writer(appender),
            )
            .try_init(),
        (LogFormat::Compact, None) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init(),
        (LogFormat::Pretty, Some(appender)) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(fmt::layer().with_ansi(false).with_writer(appender))
            .try_init(),
        (LogFormat::Pretty, None) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };

    // Silently ignore if already initialized (idempotent)
    let _ = result;
}
