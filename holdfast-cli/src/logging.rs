//! Logging configuration
//!
//! Console output goes to stderr; `--output` redirects everything to a file
//! through a non-blocking writer. The returned guard flushes that writer
//! and has to stay alive until the run is over.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: LevelFilter,
    /// Log file, stderr when unset
    pub file_path: Option<PathBuf>,
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::WARN,
            file_path: None,
            json_format: false,
        }
    }
}

/// Parse a `--log` value: a level name or a number from 3 (critical) down
/// to -1 (debug)
pub fn parse_level(value: &str) -> Result<LevelFilter> {
    let level = match value.trim().to_ascii_uppercase().as_str() {
        "CRITICAL" | "FATAL" | "3" => LevelFilter::ERROR,
        "ERROR" | "2" => LevelFilter::ERROR,
        "WARNING" | "WARN" | "1" => LevelFilter::WARN,
        "INFO" | "0" => LevelFilter::INFO,
        "DEBUG" | "-1" => LevelFilter::DEBUG,
        "TRACE" => LevelFilter::TRACE,
        "OFF" => LevelFilter::OFF,
        other => bail!("unknown log level {:?}", other),
    };
    Ok(level)
}

impl LoggingConfig {
    pub fn new(level: &str, file_path: Option<&Path>) -> Result<Self> {
        Ok(Self {
            level: parse_level(level)?,
            file_path: file_path.map(Path::to_path_buf),
            ..Default::default()
        })
    }

    /// `RUST_LOG` wins over the configured level
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::default().add_directive(self.level.into()))
    }

    /// Install the global subscriber
    pub fn init(&self) -> Result<Option<WorkerGuard>> {
        let Some(path) = &self.file_path else {
            let layer = fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry()
                .with(self.filter())
                .with(layer)
                .try_init()
                .context("failed to install log subscriber")?;
            return Ok(None);
        };

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open log file {}", path.display()))?;
        let (writer, guard) = tracing_appender::non_blocking(file);

        let registry = tracing_subscriber::registry().with(self.filter());
        let installed = if self.json_format {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(writer))
                .try_init()
        } else {
            registry
                .with(fmt::layer().with_target(false).with_ansi(false).with_writer(writer))
                .try_init()
        };
        installed.context("failed to install log subscriber")?;
        Ok(Some(guard))
    }
}
