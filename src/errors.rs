// src/errors.rs

//! Crate-wide error type and `Result` alias.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskmuxError {
    /// The child process could not be started (bad executable, bad working
    /// directory, ...). Reported once to the user; never retried.
    #[error("spawn failed: {reason}")]
    Spawn { reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pattern error: {0}")]
    Pattern(#[from] regex::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TaskmuxError>;
