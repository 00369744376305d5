//! Logging infrastructure for skylink
//!
//! Installs a `tracing` subscriber suited to the embedding application:
//! nothing for UIs that own the terminal, compact stderr output while
//! developing, verbose output with thread ids and source locations when
//! debugging, or JSON lines for log collectors.

use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Logging mode for different use cases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// No output
    Silent,
    /// Compact stderr output for development
    Development,
    /// Verbose diagnostics with thread ids and source locations
    Debug,
    /// One JSON object per line
    Json,
}

/// Logging configuration error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to initialize tracing subscriber: {0}")]
    TracingInit(String),

    #[error("Invalid environment variable: {0}")]
    InvalidEnv(String),
}

/// Initialize logging with the specified mode
///
/// Call early, before creating a controller, so connection events are
/// captured. The loop and no-ack threads are named (`skylink-loop`,
/// `skylink-noack-N`), which `Debug` mode shows alongside thread ids.
///
/// # Examples
///
/// ```rust,ignore
/// skylink_core::logging::init_logging(LoggingMode::Development)?;
/// ```
///
/// # Environment Variables
///
/// - `SKYLINK_LOG_LEVEL`: filter directives (e.g. `skylink_core=debug`),
///   falling back to `RUST_LOG`
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
                        .with_thread_names(true)
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
                        .with_thread_names(true)
                        .with_file(true)
                        .with_line_number(true),
                )
                .with(filter)
                .try_init()
                .map_err(|e| LoggingError::TracingInit(e.to_string()))
        }
        LoggingMode::Json => {
            let filter = create_env_filter("info")?;

            Registry::default()
                .with(fmt::layer().json().with_thread_names(true))
                .with(filter)
                .try_init()
                .map_err(|e| LoggingError::TracingInit(e.to_string()))
        }
    }
}

/// Parse a mode name as used by `SKYLINK_LOG_MODE`
pub fn parse_mode(value: &str) -> Result<LoggingMode, LoggingError> {
    match value.to_ascii_lowercase().as_str() {
        "silent" => Ok(LoggingMode::Silent),
        "development" | "dev" => Ok(LoggingMode::Development),
        "debug" => Ok(LoggingMode::Debug),
        "json" => Ok(LoggingMode::Json),
        other => Err(LoggingError::InvalidEnv(format!(
            "SKYLINK_LOG_MODE={}",
            other
        ))),
    }
}

/// Initialize logging from environment variables
///
/// Reads `SKYLINK_LOG_MODE` (`silent`, `development`, `debug`, `json`).
/// Defaults to Silent when unset; an unknown value is an error.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    let mode = match std::env::var("SKYLINK_LOG_MODE") {
        Ok(value) => parse_mode(&value)?,
        Err(_) => LoggingMode::Silent,
    };

    init_logging(mode)
}

/// Create an environment filter with fallback to default level
fn create_env_filter(default_level: &str) -> Result<EnvFilter, LoggingError> {
    let directives = std::env::var("SKYLINK_LOG_LEVEL")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_level.to_string());

    EnvFilter::try_new(&directives)
        .map_err(|e| LoggingError::InvalidEnv(format!("{}: {}", directives, e)))
}

/// Check if a global subscriber has been installed
pub fn is_initialized() -> bool {
    tracing::dispatcher::has_been_set()
}

/// Equivalent to `init_logging(LoggingMode::Silent)`
pub fn init_silent() -> Result<(), LoggingError> {
    init_logging(LoggingMode::Silent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_silent_mode() {
        assert!(init_logging(LoggingMode::Silent).is_ok());
        assert!(init_silent().is_ok());
    }

    #[rstest]
    #[case("silent", LoggingMode::Silent)]
    #[case("development", LoggingMode::Development)]
    #[case("DEV", LoggingMode::Development)]
    #[case("debug", LoggingMode::Debug)]
    #[case("json", LoggingMode::Json)]
    fn test_parse_mode(#[case] value: &str, #[case] expected: LoggingMode) {
        assert_eq!(parse_mode(value).unwrap(), expected);
    }

    #[test]
    fn test_parse_unknown_mode() {
        let error = parse_mode("loud").unwrap_err();
        assert_eq!(
            error.to_string(),
            "Invalid environment variable: SKYLINK_LOG_MODE=loud"
        );
    }
}
