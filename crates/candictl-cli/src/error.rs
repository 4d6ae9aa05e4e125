//! Error types for the CLI

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failure inside a driver
    #[error(transparent)]
    Core(#[from] candictl_common::Error),

    /// Local file or process failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed YAML
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Malformed JSON
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid flags or input
    #[error("validation error: {message}")]
    Validation {
        /// What is wrong
        message: String,
    },

    /// An external step failed
    #[error("command failed: {message}")]
    CommandFailed {
        /// What failed
        message: String,
    },
}

impl Error {
    /// Invalid flags or input
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    /// An external step failed
    pub fn command_failed(message: impl Into<String>) -> Self {
        Error::CommandFailed {
            message: message.into(),
        }
    }
}
