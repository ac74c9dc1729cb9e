//! Logging setup for applications embedding an item tree
//!
//! Libraries in this workspace only emit `tracing` events; installing a
//! subscriber is up to the application. These helpers cover the common
//! cases, including a silent mode for processes whose stdout is a protocol.

use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Logging mode for different use cases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// No output
    Silent,
    /// Compact stderr output
    Development,
    /// Verbose output with source locations
    Debug,
}

/// Logging configuration error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to initialize tracing subscriber: {0}")]
    TracingInit(String),

    #[error("Invalid environment variable: {0}")]
    InvalidEnv(String),
}

impl LoggingMode {
    /// Parse a mode name as used in `VEITEM_LOG_MODE`
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "silent" => Some(LoggingMode::Silent),
            "development" => Some(LoggingMode::Development),
            "debug" => Some(LoggingMode::Debug),
            _ => None,
        }
    }
}

/// Initialize logging with the specified mode
///
/// # Environment Variables
///
/// - `VEITEM_LOG_LEVEL`: filter directives (e.g. `veitem_mqtt=trace`)
/// - `RUST_LOG`: used when `VEITEM_LOG_LEVEL` is not set
pub fn init_logging(mode: LoggingMode) -> Result<(), LoggingError> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    match mode {
        LoggingMode::Silent => Ok(()),
        LoggingMode::Development => {
            let filter = create_env_filter("info")?;

            Registry::default()
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_thread_ids(false)
                        .compact(),
                )
                .with(filter)
                .try_init()
                .map_err(|e| LoggingError::TracingInit(e.to_string()))
        }
        LoggingMode::Debug => {
            let filter = create_env_filter("debug")?;

            Registry::default()
                .with(
                    fmt::layer()
                        .pretty()
                        .with_thread_ids(true)
                        .with_file(true)
                        .with_line_number(true),
                )
                .with(filter)
                .try_init()
                .map_err(|e| LoggingError::TracingInit(e.to_string()))
        }
    }
}

/// Initialize logging from `VEITEM_LOG_MODE`
///
/// Unset means silent; an unknown mode name is an error.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    let mode = match std::env::var("VEITEM_LOG_MODE") {
        Ok(name) => LoggingMode::parse(&name)
            .ok_or_else(|| LoggingError::InvalidEnv(format!("VEITEM_LOG_MODE={}", name)))?,
        Err(_) => LoggingMode::Silent,
    };

    init_logging(mode)
}

/// Filter from `VEITEM_LOG_LEVEL`, then `RUST_LOG`, then the default level
fn create_env_filter(default_level: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(level) = std::env::var("VEITEM_LOG_LEVEL") {
        return EnvFilter::try_new(&level)
            .map_err(|e| LoggingError::InvalidEnv(format!("VEITEM_LOG_LEVEL={}: {}", level, e)));
    }
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        return Ok(EnvFilter::new(rust_log));
    }
    Ok(EnvFilter::new(default_level))
}

/// Check if a global subscriber has been installed
pub fn is_initialized() -> bool {
    tracing::dispatcher::has_been_set()
}

pub fn init_silent() -> Result<(), LoggingError> {
    init_logging(LoggingMode::Silent)
}
