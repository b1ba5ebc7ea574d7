//! Structured logging setup on `tracing`.
//!
//! The pipeline logs through the `tracing` macros; this module wires up a
//! subscriber for processes that do not bring their own. Supports pretty,
//! compact, and JSON output, a `RUST_LOG` override via [`EnvFilter`], and
//! idempotent initialization so tests and embedding applications can call it
//! freely.
//!
//! # Example
//! ```no_run
//! use scan_pipeline::{config::Settings, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load()?;
//! logging::init_from_settings(&settings)?;
//! tracing::info!("acquisition host started");
//! # Ok(())
//! # }
//! ```

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::Settings;
use crate::error::{PipelineError, PipelineResult};

/// Output format for log lines.
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Multi-line, colorized output for development.
    Pretty,
    /// Single-line output for production consoles.
    Compact,
    /// JSON lines for log aggregation.
    Json,
}

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default level when `RUST_LOG` is unset.
    pub level: Level,
    /// Output format.
    pub format: OutputFormat,
    /// Emit span open/close events.
    pub with_span_events: bool,
    /// Include source file and line number.
    pub with_file_and_line: bool,
    /// Include thread names.
    pub with_thread_names: bool,
    /// ANSI colors (pretty format only).
    pub with_ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: true,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl LogConfig {
    /// Config at the given default level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set the output format.
    #[must_use]
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span open/close events.
    #[must_use]
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable ANSI colors.
    #[must_use]
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize logging from loaded [`Settings`].
///
/// # Errors
///
/// [`PipelineError::Configuration`] when the configured log level is not
/// recognised or subscriber installation fails.
pub fn init_from_settings(settings: &Settings) -> PipelineResult<()> {
    let level = parse_log_level(&settings.application.log_level)?;
    init(LogConfig::new(level))
}

/// Initialize logging with explicit options.
///
/// Idempotent: a subscriber installed earlier in the process wins and this
/// call returns `Ok(())`, which keeps parallel tests quiet.
///
/// # Errors
///
/// [`PipelineError::Configuration`] if installation fails for any other
/// reason.
pub fn init(config: LogConfig) -> PipelineResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let result = match config.format {
        OutputFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .pretty()
                .with_span_events(span_events)
                .with_file(config.with_file_and_line)
                .with_line_number(config.with_file_and_line)
                .with_thread_names(config.with_thread_names)
                .with_ansi(config.with_ansi)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(fmt_layer).try_init()
        }
        OutputFormat::Compact => {
            let fmt_layer = fmt::layer()
                .compact()
                .with_span_events(span_events)
                .with_file(config.with_file_and_line)
                .with_line_number(config.with_file_and_line)
                .with_thread_names(config.with_thread_names)
                .with_ansi(false)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(fmt_layer).try_init()
        }
        OutputFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_span_events(span_events)
                .with_file(config.with_file_and_line)
                .with_line_number(config.with_file_and_line)
                .with_thread_names(config.with_thread_names)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(fmt_layer).try_init()
        }
    };

    tolerate_reinit(result)
}

/// Treat "already initialized" as success; anything else is a real error.
fn tolerate_reinit(
    result: Result<(), tracing_subscriber::util::TryInitError>,
) -> PipelineResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err)
            if err
                .to_string()
                .contains("a global default trace dispatcher has already been set") =>
        {
            Ok(())
        }
        Err(err) => Err(PipelineError::Configuration(format!(
            "failed to initialize logging: {err}"
        ))),
    }
}

fn parse_log_level(level: &str) -> PipelineResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(PipelineError::Configuration(format!(
            "invalid log level '{level}', must be one of: trace, debug, info, warn, error"
        ))),
    }
}
