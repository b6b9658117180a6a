//! Error handling for the field report sync core

use std::fmt;
use thiserror::Error;

use crate::backend::BackendError;

/// Unified error type for the sync core
#[derive(Error, Debug)]
pub enum Error {
    /// JSON serialization or deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local file errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// An error reported by the backend
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// An operation needs a signed-in user and there is none
    #[error("Authentication required")]
    AuthRequired,

    /// Local store errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new storage error
    pub fn storage<T: fmt::Display>(msg: T) -> Self {
        Error::Storage(msg.to_string())
    }

    /// Create a new configuration error
    pub fn config<T: fmt::Display>(msg: T) -> Self {
        Error::Config(msg.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
