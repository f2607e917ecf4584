//! Error types for fbuild.

use thiserror::Error;

/// Main error type for fbuild.
#[derive(Error, Debug)]
pub enum FbuildError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Options(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed message: {0}")]
    Decode(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for fbuild operations.
pub type Result<T> = std::result::Result<T, FbuildError>;
