//! Logging initialization
//!
//! Three output styles share one subscriber stack: an `EnvFilter` (default
//! `info`, `debug` when `CANDICTL_DEBUG=yes`, `RUST_LOG` overrides both) and a
//! fmt layer in the selected style.

use std::str::FromStr;

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Environment variable enabling debug output and preserving temp dirs
pub const DEBUG_ENV: &str = "CANDICTL_DEBUG";

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Unknown logger style
    #[error("unknown logger type '{0}', expected pretty, simple or json")]
    UnknownType(String),

    /// Failed to install the global subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Output style
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoggerType {
    /// Human-oriented multi-line output
    #[default]
    Pretty,
    /// Compact single-line output
    Simple,
    /// JSON lines
    Json,
}

impl FromStr for LoggerType {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "simple" => Ok(Self::Simple),
            "json" => Ok(Self::Json),
            other => Err(LoggingError::UnknownType(other.to_string())),
        }
    }
}

/// Configuration for logging initialization
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Output style
    pub logger_type: LoggerType,
    /// Debug level
    pub debug: bool,
}

impl LogConfig {
    /// Build from the environment (`CANDICTL_DEBUG`)
    pub fn from_env(logger_type: LoggerType) -> Self {
        Self {
            logger_type,
            debug: is_debug(),
        }
    }
}

/// `CANDICTL_DEBUG=yes`
pub fn is_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| matches!(v.to_lowercase().as_str(), "yes" | "true" | "1"))
        .unwrap_or(false)
}

/// Install the global subscriber
pub fn init_logging(config: &LogConfig) -> Result<(), LoggingError> {
    let default_level = if config.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.logger_type {
        LoggerType::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init(),
        LoggerType::Simple => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .without_time()
                    .compact(),
            )
            .try_init(),
        LoggerType::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .try_init(),
    };

    result.map_err(|e| LoggingError::SubscriberInit(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_type_parse() {
        assert_eq!("JSON".parse::<LoggerType>().unwrap(), LoggerType::Json);
        assert_eq!("simple".parse::<LoggerType>().unwrap(), LoggerType::Simple);
        assert!("fancy".parse::<LoggerType>().is_err());
    }
}
