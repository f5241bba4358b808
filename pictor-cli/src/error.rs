//! CLI error handling with user-facing messages.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read config file: {0}")]
    ConfigFile(#[from] ini::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Service error: {0}")]
    Service(#[from] pictor::Error),
}
